//! Build events and the topic bus that fans them out to observers.

pub mod build;
pub mod bus;

pub use build::{CiBuildEvent, Topic};
pub use bus::{EventBus, SubscriptionHandle};
