/// Associates a registered handle with the device slot that owns it.
///
/// The reactor encodes the owning arena index into the token it hands to the
/// readiness backend, so an event can be routed back to its device without a
/// side table. `Token(usize::MAX)` is reserved for the internal waker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
