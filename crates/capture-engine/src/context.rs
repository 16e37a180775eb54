//! Where a clip came from: foreground app and related links.

use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Source information attached to a finished clip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    /// Package or application id of the foreground app.
    pub source_package: Option<String>,
    /// URL the foreground app was showing, if known.
    pub source_url: Option<String>,
}

/// Supplies the current source context. Implemented by the app monitor.
pub trait SourceContextProvider: Send + Sync {
    fn current(&self) -> SourceContext;
}

/// A context that only changes when told to.
#[derive(Debug, Default)]
pub struct StaticContext {
    inner: RwLock<SourceContext>,
}

impl StaticContext {
    pub fn new(context: SourceContext) -> Self {
        Self {
            inner: RwLock::new(context),
        }
    }

    pub fn set(&self, context: SourceContext) {
        *self.inner.write().unwrap_or_else(|p| p.into_inner()) = context;
    }
}

impl SourceContextProvider for StaticContext {
    fn current(&self) -> SourceContext {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Remembers the last link seen on the clipboard.
///
/// A link is attached to at most one clip and only while it is fresh.
#[derive(Debug, Default)]
pub struct LinkTracker {
    pending: Mutex<Option<(String, Instant)>>,
}

impl LinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect clipboard text; remember and return the first link in it.
    pub fn observe_text(&self, text: &str) -> Option<String> {
        let url = extract_url(text)?;
        tracing::info!(%url, "Captured link from clipboard");
        *self.lock() = Some((url.clone(), Instant::now()));
        Some(url)
    }

    /// Take the pending link if it was seen within `max_age`.
    pub fn take_fresh(&self, max_age: Duration) -> Option<String> {
        let mut pending = self.lock();
        match pending.take() {
            Some((url, seen)) if seen.elapsed() < max_age => Some(url),
            Some((url, _)) => {
                tracing::debug!(%url, "Discarding stale clipboard link");
                None
            }
            None => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(String, Instant)>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// First `http://` or `https://` token in `text`.
fn extract_url(text: &str) -> Option<String> {
    let start = ["https://", "http://"]
        .iter()
        .filter_map(|scheme| text.find(scheme))
        .min()?;
    let url: String = text[start..]
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect();
    let scheme_len = if url.starts_with("https://") { 8 } else { 7 };
    (url.len() > scheme_len).then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_first_link() {
        assert_eq!(
            extract_url("look at https://example.com/a?b=1 and http://other").as_deref(),
            Some("https://example.com/a?b=1")
        );
        assert_eq!(
            extract_url("http://x.io\nhttps://y.io").as_deref(),
            Some("http://x.io")
        );
        assert_eq!(extract_url("no links here"), None);
        assert_eq!(extract_url("bare https:// scheme"), None);
    }

    #[test]
    fn test_fresh_link_is_consumed_once() {
        let links = LinkTracker::new();
        assert_eq!(
            links.observe_text("share: https://v.example/123").as_deref(),
            Some("https://v.example/123")
        );
        assert_eq!(
            links.take_fresh(Duration::from_secs(180)).as_deref(),
            Some("https://v.example/123")
        );
        assert_eq!(links.take_fresh(Duration::from_secs(180)), None);
    }

    #[test]
    fn test_stale_link_is_dropped() {
        let links = LinkTracker::new();
        links.observe_text("https://v.example/123");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(links.take_fresh(Duration::from_millis(1)), None);
    }

    #[test]
    fn test_text_without_link_keeps_previous() {
        let links = LinkTracker::new();
        links.observe_text("https://keep.example");
        assert_eq!(links.observe_text("just words"), None);
        assert_eq!(
            links.take_fresh(Duration::from_secs(1)).as_deref(),
            Some("https://keep.example")
        );
    }

    #[test]
    fn test_static_context_can_be_replaced() {
        let context = StaticContext::default();
        assert_eq!(context.current(), SourceContext::default());
        context.set(SourceContext {
            source_package: Some("com.example.video".into()),
            source_url: None,
        });
        assert_eq!(
            context.current().source_package.as_deref(),
            Some("com.example.video")
        );
    }
}
