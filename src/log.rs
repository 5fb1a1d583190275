//! Logging interface, contingent on the `defmt-03` feature
//!
//! Keep these out of the retirement hot path; one interrupt can retire
//! a whole done queue.

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt-03")]
        ::defmt_03::debug!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt-03")]
        ::defmt_03::warn!($($args)*)
    };
}
