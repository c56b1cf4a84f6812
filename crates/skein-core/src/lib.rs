pub mod approval;
pub mod context;
pub mod events;
pub mod ids;
