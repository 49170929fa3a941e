mod notifier;
mod tracker;

pub use notifier::{Leadership, LeadershipFuture, Notifier};
pub use tracker::Tracker;
