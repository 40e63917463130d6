// Core modules implementing the lookaside store, its storage seam, and error modeling.
pub mod backend;
pub mod error;
pub mod lookaside;
pub mod record;
pub mod session;
pub mod table;
