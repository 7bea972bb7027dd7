pub mod enumerator;
pub mod stage;

pub use enumerator::{CrtShEnumerator, Enumerator};
pub use stage::SubdomainStageCore;
