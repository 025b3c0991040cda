pub mod config;
pub mod db;
pub mod flow;
pub mod handlers;
pub mod limiter;
pub mod model;
pub mod planner;
pub mod slots;
pub mod telegram;
pub mod worker;
