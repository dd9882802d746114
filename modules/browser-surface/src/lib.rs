pub mod error;

pub use error::{Result, SurfaceError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use futures::StreamExt;
use harvest_common::{BrowserEndpoint, ElementRef};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// URL patterns for images, fonts and media, blocked when heavy resources
/// are suppressed.
const HEAVY_RESOURCE_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.avif", "*.svg", "*.ico", "*.woff",
    "*.woff2", "*.ttf", "*.otf", "*.mp4", "*.webm", "*.mp3", "*.ogg",
];

/// One Chromium page driven over CDP.
///
/// Elements are handed out as numeric [`ElementRef`]s backed by an internal
/// table, so callers never hold CDP objects directly. The table is cleared on
/// navigation and by [`ChromeSurface::release_handles`].
pub struct ChromeSurface {
    browser: Mutex<Browser>,
    page: Page,
    elements: Mutex<HashMap<u64, Element>>,
    next_handle: AtomicU64,
    handler: JoinHandle<()>,
}

impl ChromeSurface {
    /// Launch a local browser, or attach to a remote one when the endpoint
    /// names a Browserless / DevTools URL.
    pub async fn open(endpoint: &BrowserEndpoint, headful: bool) -> Result<Self> {
        let (browser, mut handler) = match endpoint.browserless_url.as_deref() {
            Some(remote) => {
                let ws_url =
                    resolve_ws_url(remote, endpoint.browserless_token.as_deref()).await?;
                info!(endpoint = remote, "Attaching to remote browser");
                Browser::connect(ws_url).await?
            }
            None => {
                let mut builder = BrowserConfig::builder()
                    .no_sandbox()
                    .arg("--lang=ru-RU")
                    .arg("--disable-dev-shm-usage")
                    .window_size(1280, 900);
                if headful {
                    builder = builder.with_head();
                }
                if let Some(bin) = endpoint.chrome_bin.as_deref() {
                    builder = builder.chrome_executable(bin);
                }
                let config = builder.build().map_err(SurfaceError::Launch)?;
                info!(headful, "Launching local Chromium");
                Browser::launch(config).await?
            }
        };

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler event error");
                }
            }
        });

        let page = browser.new_page("about:blank").await?;

        Ok(Self {
            browser: Mutex::new(browser),
            page,
            elements: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            handler,
        })
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.release_handles().await;
        self.page.goto(url).await?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    pub async fn query(&self, selector: &str) -> Result<Vec<ElementRef>> {
        let found = self.page.find_elements(selector).await?;
        Ok(self.register(found).await)
    }

    pub async fn query_within(&self, scope: ElementRef, selector: &str) -> Result<Vec<ElementRef>> {
        let found = {
            let elements = self.elements.lock().await;
            let element = lookup(&elements, scope)?;
            element.find_elements(selector).await?
        };
        Ok(self.register(found).await)
    }

    pub async fn inner_text(&self, element: ElementRef) -> Result<String> {
        let elements = self.elements.lock().await;
        let text = lookup(&elements, element)?.inner_text().await?;
        Ok(text.unwrap_or_default())
    }

    pub async fn attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>> {
        let elements = self.elements.lock().await;
        Ok(lookup(&elements, element)?.attribute(name).await?)
    }

    /// Run `script` (a JS function expression) with the element bound to
    /// `this` and `args` as its single argument. The result travels back as
    /// JSON, so anything `JSON.stringify` accepts can be returned.
    pub async fn evaluate(
        &self,
        element: ElementRef,
        script: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let declaration = format!(
            "async function() {{ \
                const f = ({script}); \
                const out = await f.call(this, {args}); \
                return JSON.stringify(out === undefined ? null : out); \
            }}"
        );
        let elements = self.elements.lock().await;
        let returns = lookup(&elements, element)?
            .call_js_fn(declaration, true)
            .await?;
        if let Some(exception) = returns.exception_details {
            return Err(SurfaceError::Script(exception.text));
        }
        let raw = returns
            .result
            .value
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "null".to_string());
        Ok(serde_json::from_str(&raw)?)
    }

    /// DOM-level click. Spans and links that only carry a JS handler respond
    /// to this even when they have no clickable box.
    pub async fn click(&self, element: ElementRef) -> Result<()> {
        let elements = self.elements.lock().await;
        lookup(&elements, element)?
            .call_js_fn("function() { this.click(); }", false)
            .await?;
        Ok(())
    }

    /// Dispatch a mouse wheel event over the element's clickable point.
    pub async fn wheel(&self, element: ElementRef, delta_y: f64) -> Result<()> {
        let point = {
            let elements = self.elements.lock().await;
            lookup(&elements, element)?.clickable_point().await?
        };
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(point.x)
            .y(point.y)
            .delta_x(0.0)
            .delta_y(delta_y)
            .build()
            .map_err(SurfaceError::Cdp)?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn bring_to_front(&self) -> Result<()> {
        self.page.bring_to_front().await?;
        Ok(())
    }

    /// Block images, fonts and media for the rest of the session.
    pub async fn block_heavy_resources(&self) -> Result<()> {
        self.page.execute(EnableParams::default()).await?;
        let patterns: Vec<String> = HEAVY_RESOURCE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        self.page.execute(SetBlockedUrLsParams::new(patterns)).await?;
        info!(patterns = HEAVY_RESOURCE_PATTERNS.len(), "Heavy resources blocked");
        Ok(())
    }

    /// Drop every element handle issued so far.
    pub async fn release_handles(&self) {
        self.elements.lock().await.clear();
    }

    pub async fn close(self) {
        self.release_handles().await;
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!(error = %e, "Browser close failed");
        }
        self.handler.abort();
    }

    async fn register(&self, found: Vec<Element>) -> Vec<ElementRef> {
        let mut elements = self.elements.lock().await;
        found
            .into_iter()
            .map(|element| {
                let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
                elements.insert(id, element);
                ElementRef(id)
            })
            .collect()
    }
}

fn lookup(elements: &HashMap<u64, Element>, handle: ElementRef) -> Result<&Element> {
    elements
        .get(&handle.0)
        .ok_or(SurfaceError::UnknownHandle(handle.0))
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Turn a Browserless / DevTools endpoint into a websocket URL.
/// `ws(s)://` endpoints are used as-is; `http(s)://` endpoints are asked for
/// their debugger URL via `/json/version`.
async fn resolve_ws_url(endpoint: &str, token: Option<&str>) -> Result<String> {
    let base = endpoint.trim_end_matches('/');
    if base.starts_with("ws://") || base.starts_with("wss://") {
        return Ok(with_token(base, token));
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let resp = client
        .get(with_token(&format!("{base}/json/version"), token))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(SurfaceError::Api {
            status: status.as_u16(),
            message,
        });
    }

    let version: VersionInfo = resp.json().await?;
    Ok(version.web_socket_debugger_url)
}

fn with_token(url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if url.contains('?') => format!("{url}&token={token}"),
        Some(token) => format!("{url}?token={token}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_appended_as_query_parameter() {
        assert_eq!(
            with_token("ws://localhost:3000", Some("abc")),
            "ws://localhost:3000?token=abc"
        );
        assert_eq!(
            with_token("ws://localhost:3000?stealth=true", Some("abc")),
            "ws://localhost:3000?stealth=true&token=abc"
        );
        assert_eq!(with_token("ws://localhost:3000", None), "ws://localhost:3000");
    }

    #[tokio::test]
    async fn websocket_endpoints_skip_discovery() {
        let url = resolve_ws_url("wss://chrome.example.com/", Some("t"))
            .await
            .unwrap();
        assert_eq!(url, "wss://chrome.example.com?token=t");
    }
}
