//! Builtin keywords
//!
//! Assertions compare values, extractors pull data out of the latest
//! response into variables, actions mutate the context, and control
//! keywords affect pacing.

mod actions;
mod assertions;
mod control;
mod extractors;

use std::sync::Arc;

pub use actions::{DeleteVariable, Log, SetVariable};
pub use assertions::{Contains, Equals, GreaterThan, LessThan, Matches, NotContains, NotEquals, StatusCode};
pub use control::{Fail, Wait};
pub use extractors::{HeaderExtract, JsonExtract, RegexExtract};

use super::Keyword;

/// Every builtin keyword, for registry pre-loading
pub fn all() -> Vec<Arc<dyn Keyword>> {
    vec![
        Arc::new(Equals),
        Arc::new(NotEquals),
        Arc::new(Contains),
        Arc::new(NotContains),
        Arc::new(GreaterThan),
        Arc::new(LessThan),
        Arc::new(Matches),
        Arc::new(StatusCode),
        Arc::new(JsonExtract),
        Arc::new(RegexExtract),
        Arc::new(HeaderExtract),
        Arc::new(SetVariable),
        Arc::new(DeleteVariable),
        Arc::new(Log),
        Arc::new(Wait),
        Arc::new(Fail),
    ]
}
