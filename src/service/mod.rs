pub mod cards;
pub mod photo;
pub mod protocol;
pub mod server;
pub mod status;

pub use cards::{CardRegistry, CardResponse, CardStatus};
pub use photo::{Frame, PhotoContext, PhotoSession, Reply, SessionState};
pub use protocol::{PhotoResponse, Purpose, SessionHeader, Status, StatusEvent};
pub use status::{Observer, ObserverId, PublishReport, StatusHub};
