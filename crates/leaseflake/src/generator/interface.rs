use crate::Result;
use std::sync::Arc;

/// A generator whose node slot can be replaced while it keeps issuing IDs.
///
/// The lease coordinator only ever writes the slot through this trait; it
/// never reads generation state.
pub trait SlotSwap: Send + Sync {
    /// Replaces the slot used for subsequently generated IDs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotOutOfRange`] if `slot` does not fit the layout.
    ///
    /// [`Error::SlotOutOfRange`]: crate::Error::SlotOutOfRange
    fn set_slot(&self, slot: u16) -> Result<()>;

    /// Returns the slot currently encoded into new IDs.
    fn slot(&self) -> u16;
}

impl<G: SlotSwap + ?Sized> SlotSwap for Arc<G> {
    fn set_slot(&self, slot: u16) -> Result<()> {
        (**self).set_slot(slot)
    }

    fn slot(&self) -> u16 {
        (**self).slot()
    }
}
