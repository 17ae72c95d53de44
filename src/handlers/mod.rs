pub mod batches;
pub mod callbacks;
pub mod computations;
pub mod intents;
pub mod public;
pub mod transfers;
