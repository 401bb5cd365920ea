pub mod error;
pub mod features;
pub mod gain;
pub mod derivation;
pub mod resample;
pub mod gradient;
pub mod learner;
pub mod schedule;
pub mod distributed;
pub mod corpus;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod session;
