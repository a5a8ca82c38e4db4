//! Utility functions for common operations.
//!
//! - **Base URL validation**: refuses to send credentials over plain HTTP
//! - **Text processing**: one-line sanitising and width-aware truncation for
//!   rendering reply content in a terminal
//!
//! # Examples
//!
//! ```
//! use rebuttal::util::{sanitize_line, truncate_to_width, validate_base_url};
//!
//! let base = validate_base_url("https://api.example.com/v1").unwrap();
//! assert_eq!(base.path(), "/v1");
//!
//! let line = sanitize_line("multi\nline");
//! assert_eq!(truncate_to_width(&line, 8), "multi l…");
//! ```

mod text;
mod url_validator;

pub use text::{display_width, sanitize_line, truncate_to_width};
pub use url_validator::{validate_base_url, UrlValidationError};
