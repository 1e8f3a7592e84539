//! Browser automation boundary.
//!
//! The navigator only ever talks to a [`PageDriver`]: navigate, probe, click,
//! fill, read text, and wait with an explicit deadline. The production
//! implementation lives in [`chrome`]; tests script their own.

pub mod chrome;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// A bounded wait ran out. Callers decide whether this is fatal.
    #[error("timed out after {}ms waiting for {what}", after.as_millis())]
    Timeout { what: String, after: Duration },

    #[error("no element matches {what}")]
    NotFound { what: String },

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error("failed to launch browser: {0}")]
    Launch(String),
}

impl DriverError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }
}

/// How text is compared when locating an element by its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMatch {
    /// Trimmed text equals the needle.
    Exact,
    /// Trimmed text contains the needle, ignoring case.
    Contains,
}

/// Identifies one element on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    Text {
        /// Restrict candidates to this tag name; `None` means any element.
        tag: Option<String>,
        text: String,
        matching: TextMatch,
    },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    /// An element of `tag` whose text contains `text`.
    pub fn tag_with_text(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::Text {
            tag: Some(tag.into()),
            text: text.into(),
            matching: TextMatch::Contains,
        }
    }

    /// The innermost element whose text is exactly `text`.
    pub fn exact_text(text: impl Into<String>) -> Self {
        Locator::Text {
            tag: None,
            text: text.into(),
            matching: TextMatch::Exact,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(selector) => f.write_str(selector),
            Locator::Text {
                tag,
                text,
                matching: TextMatch::Contains,
            } => write!(f, "{}:has-text({text:?})", tag.as_deref().unwrap_or("*")),
            Locator::Text {
                tag,
                text,
                matching: TextMatch::Exact,
            } => match tag {
                Some(tag) => write!(f, "{tag}:text-is({text:?})"),
                None => write!(f, "text={text:?}"),
            },
        }
    }
}

/// The element condition a wait is satisfied by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    /// Present and rendered with a non-empty box.
    Visible,
    /// Present in the DOM, rendered or not.
    Attached,
    /// Gone from the DOM.
    Detached,
}

impl ElementState {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementState::Visible => "visible",
            ElementState::Attached => "attached",
            ElementState::Detached => "detached",
        }
    }
}

/// A single live page in a browser session.
///
/// Every wait takes its own deadline. No method retries internally.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate and wait for the `load` event, up to `timeout`.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Probe once, without waiting.
    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError>;

    async fn wait_for(
        &self,
        locator: &Locator,
        state: ElementState,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Dispatch a click even if another element overlaps the target.
    async fn click(&self, locator: &Locator) -> Result<(), DriverError>;

    /// Replace the value of an input.
    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError>;

    /// Raw `textContent` of the element, `None` if it has none.
    async fn text_content(&self, locator: &Locator) -> Result<Option<String>, DriverError>;

    /// Wait until the page is loaded and no new resources have been
    /// requested for a short quiet period.
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), DriverError>;

    /// Tear down the whole browser session.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Starts a fresh browser session for each cycle.
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    type Driver: PageDriver + 'static;

    async fn launch(&self) -> Result<Self::Driver, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locators_render_like_selectors() {
        assert_eq!(Locator::css("#login").to_string(), "#login");
        assert_eq!(
            Locator::tag_with_text("button", "Log in").to_string(),
            "button:has-text(\"Log in\")"
        );
        assert_eq!(Locator::exact_text("Log in").to_string(), "text=\"Log in\"");
    }

    #[test]
    fn timeout_error_reports_budget() {
        let err = DriverError::Timeout {
            what: "#status".to_string(),
            after: Duration::from_millis(8000),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "timed out after 8000ms waiting for #status");
        assert!(!DriverError::NotFound { what: "#x".into() }.is_timeout());
    }
}
