mod classify;
mod config;
mod content_rules;
mod controller;
mod error;
mod operator;
mod rotator;
mod runtime;
mod types;
mod watchdog;
mod webdriver;

pub use runtime::run;
