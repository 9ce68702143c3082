//! HTML to PDF conversion through a headless browser.

mod chrome;
mod pool;
mod types;

pub use chrome::HeadlessChromeConverter;
pub use pool::{SessionLease, SessionPool};
pub use types::{ConvertError, DocumentConverter};
