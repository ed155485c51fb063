//! # wasend-sheets
//!
//! Turns an uploaded spreadsheet into a list of message recipients.

mod phone;
mod template;
mod workbook;


pub use phone::normalize_phone;
pub use template::render_template;
pub use workbook::{parse_recipients, Recipient, RecipientSheet, PHONE_HEADERS};
