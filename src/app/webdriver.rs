use std::fs::{self, File};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Method;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use url::Url;

use super::content_rules::{BrowserTweaks, ContentRuleList};
use super::controller::Renderer;
use super::error::MonitorError;
use super::types::{AbortTaskOnDrop, AttemptId, BrowserArg, Cli, MonitorEvent, MonitoredUrl};

const WINDOW_WIDTH: u32 = 960;
const WINDOW_HEIGHT: u32 = 540;

const OUTER_HTML_SCRIPT: &str = "return document.documentElement.outerHTML.toString();";

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub endpoint: String,
    pub browser: BrowserArg,
    pub headless: bool,
    pub driver_binary: Option<String>,
    pub autostart: bool,
    pub start_timeout: Duration,
    pub page_load_timeout: Duration,
}

impl WebDriverConfig {
    /// The driver's own page-load timeout sits a little past the watchdog so the
    /// watchdog normally decides first.
    pub fn from_cli(cli: &Cli, load_timeout: Duration) -> Self {
        Self {
            endpoint: cli.webdriver_url.clone(),
            browser: cli.webdriver_browser,
            headless: cli.webdriver_headless,
            driver_binary: cli.webdriver_binary.clone(),
            autostart: !cli.no_webdriver_autostart,
            start_timeout: Duration::from_millis(cli.webdriver_start_timeout_ms),
            page_load_timeout: load_timeout + Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("{0}")]
    SessionLost(String),
    #[error("{0}")]
    Command(String),
}

fn is_session_lost(error: &str, message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    matches!(error, "invalid session id" | "no such window")
        || message.contains("tab crashed")
        || message.contains("page crash")
        || message.contains("browsing context has been discarded")
}

/// Shared handle to one WebDriver endpoint. The session id is created lazily and
/// recreated after it is lost.
#[derive(Clone)]
struct DriverLink {
    client: reqwest::Client,
    endpoint: String,
    capabilities: Arc<Value>,
    session: Arc<Mutex<Option<String>>>,
}

impl DriverLink {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        label: &str,
    ) -> Result<Value, DriverError> {
        let mut request = self.client.request(method, format!("{}{path}", self.endpoint));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let res = request.send().await.map_err(|e| {
            let detail = format!("{label} request failed: {e}");
            if e.is_connect() {
                DriverError::SessionLost(detail)
            } else {
                DriverError::Command(detail)
            }
        })?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| DriverError::Command(format!("{label} response read failed: {e}")))?;

        let value: Value = serde_json::from_str(&body).unwrap_or_default();
        if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
            let message = value
                .pointer("/value/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown webdriver error");
            let detail = format!("{label} {err}: {}", truncate_for_log(message, 240));
            return Err(if is_session_lost(err, message) {
                DriverError::SessionLost(detail)
            } else {
                DriverError::Command(detail)
            });
        }
        if !status.is_success() {
            return Err(DriverError::Command(format!(
                "{label} HTTP {}: {}",
                status.as_u16(),
                truncate_for_log(&body, 240)
            )));
        }
        Ok(value)
    }

    async fn session(&self) -> Result<String, DriverError> {
        let mut slot = self.session.lock().await;
        if let Some(id) = slot.as_ref() {
            return Ok(id.clone());
        }
        let id = self.create_session().await?;
        *slot = Some(id.clone());
        Ok(id)
    }

    async fn forget_session(&self, session_id: &str) {
        let mut slot = self.session.lock().await;
        if slot.as_deref() == Some(session_id) {
            *slot = None;
        }
    }

    async fn create_session(&self) -> Result<String, DriverError> {
        let value = self
            .command(
                Method::POST,
                "/session",
                Some(self.capabilities.as_ref().clone()),
                "session create",
            )
            .await?;
        let session_id = value
            .pointer("/value/sessionId")
            .and_then(|v| v.as_str())
            .or_else(|| value.pointer("/sessionId").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .ok_or_else(|| {
                DriverError::Command(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&value.to_string(), 220)
                ))
            })?;

        let rect = json!({ "width": WINDOW_WIDTH, "height": WINDOW_HEIGHT });
        if let Err(err) = self
            .command(
                Method::POST,
                &format!("/session/{session_id}/window/rect"),
                Some(rect),
                "window resize",
            )
            .await
        {
            debug!(%err, "window resize not supported");
        }

        info!(session = %session_id, "WebDriver session created");
        Ok(session_id)
    }

    async fn navigate(&self, session_id: &str, url: &str) -> Result<(), DriverError> {
        self.command(
            Method::POST,
            &format!("/session/{session_id}/url"),
            Some(json!({ "url": url })),
            "navigate",
        )
        .await
        .map(|_| ())
    }

    async fn outer_html(&self, session_id: &str) -> Result<String, DriverError> {
        let value = self
            .command(
                Method::POST,
                &format!("/session/{session_id}/execute/sync"),
                Some(json!({ "script": OUTER_HTML_SCRIPT, "args": [] })),
                "execute script",
            )
            .await?;
        value
            .pointer("/value")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| DriverError::Command("script returned no markup".to_string()))
    }

    async fn delete_session(&self) {
        let Some(session_id) = self.session.lock().await.take() else {
            return;
        };
        if let Err(err) = self
            .command(
                Method::DELETE,
                &format!("/session/{session_id}"),
                None,
                "delete session",
            )
            .await
        {
            warn!(%err, "WebDriver session cleanup failed");
        }
    }
}

async fn load_page(
    link: DriverLink,
    attempt: AttemptId,
    url: String,
    events: UnboundedSender<MonitorEvent>,
) {
    let _ = events.send(MonitorEvent::LoadStarted { attempt });

    // A session that cannot be created is retried with a delay, never in a tight loop.
    let session_id = match link.session().await {
        Ok(id) => id,
        Err(err) => {
            let _ = events.send(MonitorEvent::NavigationFailed {
                attempt,
                reason: err.to_string(),
            });
            return;
        }
    };

    match link.navigate(&session_id, &url).await {
        Ok(()) => {}
        Err(DriverError::SessionLost(reason)) => {
            link.forget_session(&session_id).await;
            let _ = events.send(MonitorEvent::RendererTerminated { attempt, reason });
            return;
        }
        Err(DriverError::Command(reason)) => {
            let _ = events.send(MonitorEvent::NavigationFailed { attempt, reason });
            return;
        }
    }
    let _ = events.send(MonitorEvent::NavigationFinished { attempt });

    let event = match link.outer_html(&session_id).await {
        Ok(markup) => MonitorEvent::MarkupReady { attempt, markup },
        Err(DriverError::SessionLost(reason)) => {
            link.forget_session(&session_id).await;
            MonitorEvent::RendererTerminated { attempt, reason }
        }
        Err(DriverError::Command(reason)) => MonitorEvent::EvaluationFailed { attempt, reason },
    };
    let _ = events.send(event);
}

/// Renders product pages in a real browser driven over the W3C WebDriver protocol.
pub struct WebDriverRenderer {
    link: DriverLink,
    in_flight: Option<AbortTaskOnDrop>,
    driver: Option<Child>,
}

impl WebDriverRenderer {
    pub async fn connect(
        config: &WebDriverConfig,
        rules: &ContentRuleList,
    ) -> Result<Self, MonitorError> {
        let endpoint = normalize_local_webdriver_endpoint(&config.endpoint);
        let driver = if webdriver_reachable(&endpoint) {
            info!(%endpoint, "WebDriver endpoint reachable");
            None
        } else if config.autostart {
            let child = start_webdriver(config, &endpoint)
                .await
                .map_err(MonitorError::WebDriver)?;
            info!(%endpoint, "WebDriver autostarted");
            Some(child)
        } else {
            return Err(MonitorError::WebDriver(format!(
                "endpoint {endpoint} unreachable and --no-webdriver-autostart is set"
            )));
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| MonitorError::WebDriver(format!("http client build failed: {e}")))?;
        let capabilities = webdriver_capabilities(
            config.browser,
            config.headless,
            config.page_load_timeout,
            &rules.lower(config.browser),
        );
        let link = DriverLink {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            capabilities: Arc::new(capabilities),
            session: Arc::new(Mutex::new(None)),
        };

        if let Err(err) = link.session().await {
            stop_webdriver(driver);
            return Err(MonitorError::WebDriver(err.to_string()));
        }

        Ok(Self {
            link,
            in_flight: None,
            driver,
        })
    }

    pub async fn shutdown(mut self) {
        self.cancel();
        self.link.delete_session().await;
        stop_webdriver(self.driver.take());
    }
}

impl Renderer for WebDriverRenderer {
    fn load(
        &mut self,
        attempt: AttemptId,
        page: &MonitoredUrl,
        events: &UnboundedSender<MonitorEvent>,
    ) {
        self.cancel();
        let handle = tokio::spawn(load_page(
            self.link.clone(),
            attempt,
            page.url.to_string(),
            events.clone(),
        ));
        self.in_flight = Some(AbortTaskOnDrop(handle.abort_handle()));
    }

    fn cancel(&mut self) {
        self.in_flight = None;
    }
}

fn webdriver_reachable(endpoint: &str) -> bool {
    let parsed = match Url::parse(endpoint) {
        Ok(u) => u,
        Err(_) => return false,
    };
    let host = match parsed.host_str() {
        Some(h) => h,
        None => return false,
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

fn default_driver_binary(browser: BrowserArg) -> &'static str {
    match browser {
        BrowserArg::Chrome => "chromedriver",
        BrowserArg::Firefox => "geckodriver",
        BrowserArg::Edge => "msedgedriver",
        BrowserArg::Safari => "safaridriver",
    }
}

async fn start_webdriver(config: &WebDriverConfig, endpoint: &str) -> Result<Child, String> {
    let parsed = Url::parse(endpoint).map_err(|e| format!("invalid webdriver url: {e}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| "webdriver url has no host".to_string())?
        .to_ascii_lowercase();
    if host != "localhost" && host != "127.0.0.1" {
        return Err("autostart only supports localhost endpoints".to_string());
    }
    let port = parsed.port_or_known_default().unwrap_or(4444);

    let bin = config
        .driver_binary
        .clone()
        .unwrap_or_else(|| default_driver_binary(config.browser).to_string());
    if !webdriver_binary_available(&bin) {
        return Err(format!("{bin} not found; start a WebDriver server or pass --webdriver-binary"));
    }

    let log_path = webdriver_log_path(port)?;
    let log_file = File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .map_err(|e| format!("failed to open webdriver log {}: {e}", log_path.display()))?;
    let log_file_err = log_file
        .try_clone()
        .map_err(|e| format!("failed to clone webdriver log handle: {e}"))?;

    let mut cmd = Command::new(&bin);
    configure_webdriver_command(&mut cmd, &bin, config.browser, port);
    cmd.stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .stdin(Stdio::null());

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn {bin}: {e}"))?;
    let steps = (config.start_timeout.as_millis() / 200).max(1);
    for _ in 0..steps {
        if webdriver_reachable(endpoint) {
            return Ok(child);
        }
        if let Ok(Some(status)) = child.try_wait() {
            let mut err = format!(
                "{bin} exited early with status {status} (log: {})",
                log_path.display()
            );
            if let Some(tail) = read_log_tail(&log_path, 30) {
                err = format!("{err}; tail: {tail}");
            }
            return Err(err);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = child.kill();
    let _ = child.wait();
    let mut err = format!(
        "{bin} did not become ready in time (log: {})",
        log_path.display()
    );
    if let Some(tail) = read_log_tail(&log_path, 30) {
        err = format!("{err}; tail: {tail}");
    }
    Err(err)
}

fn configure_webdriver_command(cmd: &mut Command, bin: &str, browser: BrowserArg, port: u16) {
    let lower = bin.to_ascii_lowercase();
    if matches!(browser, BrowserArg::Safari)
        || lower.contains("safaridriver")
        || lower.contains("geckodriver")
    {
        cmd.arg("--port").arg(port.to_string());
        return;
    }
    cmd.arg(format!("--port={port}"));
    if lower.contains("chromedriver") {
        cmd.arg("--log-level=SEVERE");
    }
}

fn webdriver_capabilities(
    browser: BrowserArg,
    headless: bool,
    page_load_timeout: Duration,
    tweaks: &BrowserTweaks,
) -> Value {
    let mut caps = match browser {
        BrowserArg::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            args.extend(tweaks.args.iter().cloned());
            let mut prefs = serde_json::Map::new();
            prefs.insert("browser.cache.disk.enable".to_string(), json!(false));
            prefs.insert("browser.cache.memory.enable".to_string(), json!(false));
            prefs.insert("network.http.use-cache".to_string(), json!(false));
            prefs.extend(tweaks.prefs.clone());
            let mut firefox_options = json!({ "args": args, "prefs": prefs });
            if let Some(binary) = detect_browser_binary(BrowserArg::Firefox) {
                firefox_options["binary"] = json!(binary.to_string_lossy().to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "moz:firefoxOptions": firefox_options
                    }
                }
            })
        }
        BrowserArg::Edge => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push(format!("--window-size={WINDOW_WIDTH},{WINDOW_HEIGHT}"));
            args.push("--disk-cache-size=0".to_string());
            args.extend(tweaks.args.iter().cloned());
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "MicrosoftEdge",
                        "ms:edgeOptions": { "args": args, "prefs": tweaks.prefs }
                    }
                }
            })
        }
        BrowserArg::Safari => json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "safari"
                }
            }
        }),
        BrowserArg::Chrome => {
            let mut args = Vec::<String>::new();
            let profile_dir = std::env::temp_dir().join(format!(
                "restock-watch-chrome-profile-{}-{}",
                std::process::id(),
                Utc::now().timestamp_millis()
            ));
            let _ = fs::create_dir_all(&profile_dir);
            args.push(format!("--user-data-dir={}", profile_dir.display()));
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push(format!("--window-size={WINDOW_WIDTH},{WINDOW_HEIGHT}"));
            args.push("--disable-dev-shm-usage".to_string());
            args.push("--no-first-run".to_string());
            args.push("--no-default-browser-check".to_string());
            args.push("--disk-cache-size=0".to_string());
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            args.extend(tweaks.args.iter().cloned());
            let mut chrome_options = json!({ "args": args, "prefs": tweaks.prefs });
            if let Some(binary) = detect_browser_binary(BrowserArg::Chrome) {
                chrome_options["binary"] = json!(binary.to_string_lossy().to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "goog:chromeOptions": chrome_options
                    }
                }
            })
        }
    };

    caps["capabilities"]["alwaysMatch"]["pageLoadStrategy"] = json!("normal");
    caps["capabilities"]["alwaysMatch"]["timeouts"] = json!({
        "pageLoad": page_load_timeout.as_millis() as u64,
        "script": 30_000
    });
    caps
}

fn detect_browser_binary(browser: BrowserArg) -> Option<PathBuf> {
    match browser {
        BrowserArg::Firefox => {
            if let Ok(v) = std::env::var("FIREFOX_BIN") {
                let p = PathBuf::from(v);
                if p.exists() {
                    return Some(p);
                }
            }
            #[cfg(target_os = "macos")]
            {
                let p = PathBuf::from("/Applications/Firefox.app/Contents/MacOS/firefox");
                if p.exists() {
                    return Some(p);
                }
            }
            None
        }
        BrowserArg::Chrome => {
            if let Ok(v) = std::env::var("CHROME_BIN") {
                let p = PathBuf::from(v);
                if p.exists() {
                    return Some(p);
                }
            }
            #[cfg(target_os = "macos")]
            {
                let p =
                    PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
                if p.exists() {
                    return Some(p);
                }
            }
            None
        }
        BrowserArg::Edge | BrowserArg::Safari => None,
    }
}

fn normalize_local_webdriver_endpoint(endpoint: &str) -> String {
    let Ok(url) = Url::parse(endpoint) else {
        return endpoint.to_string();
    };
    let Some(host) = url.host_str() else {
        return endpoint.to_string();
    };
    if host != "localhost" && host != "127.0.0.1" {
        return endpoint.trim_end_matches('/').to_string();
    }
    let scheme = url.scheme();
    let port = url.port_or_known_default().unwrap_or(4444);
    format!("{scheme}://127.0.0.1:{port}")
}

fn webdriver_binary_available(bin: &str) -> bool {
    let p = Path::new(bin);
    if p.components().count() > 1 || p.is_absolute() {
        return p.exists();
    }
    Command::new(bin)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn stop_webdriver(mut child: Option<Child>) {
    if let Some(ref mut c) = child {
        let _ = c.kill();
        let _ = c.wait();
    }
}

fn webdriver_log_path(port: u16) -> Result<PathBuf, String> {
    let log_dir = std::env::temp_dir().join("restock-watch");
    fs::create_dir_all(&log_dir).map_err(|e| format!("log dir create failed: {e}"))?;
    Ok(log_dir.join(format!("webdriver-{port}.log")))
}

fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let tail = text
        .lines()
        .rev()
        .take(lines.max(1))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ");
    if tail.is_empty() { None } else { Some(tail) }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}
