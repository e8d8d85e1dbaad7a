pub mod locator;
pub mod parse;
pub mod ping;
pub mod runner;
pub mod scrcpy;
pub mod transport;
