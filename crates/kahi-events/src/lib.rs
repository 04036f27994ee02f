// kahi-events: Event model, in-process pub/sub bus, and periodic ticker.
// Leaf crate — everything else in the supervisor publishes into or
// subscribes through this.

pub mod bus;
pub mod event;
pub mod ticker;

pub use bus::EventBus;
pub use event::{Event, EventType, UnknownEventType};
pub use ticker::Ticker;
