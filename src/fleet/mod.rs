pub mod cloud;
pub mod state;
pub mod worker;

#[cfg(test)]
mod tests;

pub use self::cloud::{AwsCredentials, CloudConfig, CloudLauncher};
pub use self::state::{SelectionStrategy, State, StateRef, WorkerLauncher};
pub use self::worker::{Worker, WorkerState};
