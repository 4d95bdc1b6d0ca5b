//! Browser session driven through a W3C WebDriver endpoint
//! (chromedriver, geckodriver or a Selenium grid).

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::session::{BrowserSession, RawPin, SessionFactory};
use crate::clock::{sleep_unless_stopped, Clock};
use crate::config::Credentials;
use crate::error::CrawlError;

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const LOGIN_URL: &str = "https://www.pinterest.com/login/";

const EXTRACT_SCRIPT: &str = r#"
return Array.from(document.querySelectorAll("[data-test-id='pin']")).map(function (el) {
    var link = el.querySelector("a[href*='/pin/']") || el.querySelector("a");
    var img = el.querySelector("img");
    var desc = el.querySelector("[data-test-id='pin-description']");
    var href = link ? link.getAttribute("href") : null;
    var id = el.getAttribute("data-test-pin-id");
    return {
        pin_id: id,
        href: href,
        image_src: img ? (img.getAttribute("src") || img.getAttribute("data-src")) : null,
        alt: img ? img.getAttribute("alt") : null,
        description: desc ? desc.textContent : null
    };
});
"#;

const AUTH_WALL_SCRIPT: &str = r#"
return !!(document.querySelector("[data-test-id='signup']")
    || document.querySelector("[data-test-id='login-modal']")
    || document.querySelector("div[data-test-id='fullPageSignupModal']"));
"#;

const BOT_CHALLENGE_SCRIPT: &str = r##"
var text = (document.body && document.body.innerText || "").toLowerCase();
return !!(document.querySelector("iframe[src*='captcha']")
    || document.querySelector("#px-captcha")
    || text.indexOf("unusual activity") >= 0);
"##;

const END_MARKER_SCRIPT: &str = r#"
return !!document.querySelector("[data-test-id='board-end'], [data-test-id='more-ideas-header']");
"#;

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight); return null;";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
];

fn random_user_agent() -> &'static str {
    USER_AGENTS[rand::rng().random_range(0..USER_AGENTS.len())]
}

/// Whether the browser was redirected to the login page.
fn is_login_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.contains("/login/") || path.ends_with("/login")
}

/// Wait on `clock`, giving up with [`CrawlError::Cancelled`] once `stop` is raised.
fn pause(clock: &dyn Clock, duration: Duration, stop: &AtomicBool) -> Result<(), CrawlError> {
    if sleep_unless_stopped(clock, duration, stop) {
        Ok(())
    } else {
        Err(CrawlError::Cancelled)
    }
}

/// Opens one WebDriver session per crawled board.
pub struct WebDriverFactory {
    endpoint: String,
    headless: bool,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
}

impl WebDriverFactory {
    pub fn new(
        endpoint: &str,
        headless: bool,
        clock: Arc<dyn Clock>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            headless,
            clock,
            stop,
        }
    }
}

impl SessionFactory for WebDriverFactory {
    fn open(&self) -> Result<Box<dyn BrowserSession>> {
        let session = WebDriverSession::start(
            &self.endpoint,
            self.headless,
            self.clock.clone(),
            self.stop.clone(),
        )?;
        Ok(Box::new(session))
    }
}

pub struct WebDriverSession {
    agent: ureq::Agent,
    base: String,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
}

fn transient(context: &str, err: impl std::fmt::Display) -> CrawlError {
    CrawlError::Transient(format!("{}: {}", context, err))
}

impl WebDriverSession {
    /// Create a new browser session on the WebDriver endpoint.
    pub fn start(
        endpoint: &str,
        headless: bool,
        clock: Arc<dyn Clock>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();

        let user_agent = random_user_agent();
        let mut args = vec![
            "--disable-blink-features=AutomationControlled".to_string(),
            "--window-size=1366,900".to_string(),
            "--no-sandbox".to_string(),
            format!("--user-agent={}", user_agent),
        ];
        if headless {
            args.push("--headless=new".to_string());
        }
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        });

        let response: Value = agent
            .post(&format!("{}/session", endpoint))
            .send_json(capabilities)
            .with_context(|| format!("Failed to reach WebDriver at {}", endpoint))?
            .into_json()
            .context("Invalid WebDriver session response")?;

        let session_id = response["value"]["sessionId"]
            .as_str()
            .ok_or_else(|| anyhow!("WebDriver did not return a session id"))?;
        info!(session = session_id, headless, user_agent, "Browser session started");

        Ok(Self {
            agent,
            base: format!("{}/session/{}", endpoint, session_id),
            clock,
            stop,
        })
    }

    fn post(&self, path: &str, body: Value) -> Result<Value, CrawlError> {
        let response: Value = self
            .agent
            .post(&format!("{}{}", self.base, path))
            .send_json(body)
            .map_err(|e| transient(path, e))?
            .into_json()
            .map_err(|e| transient(path, e))?;
        Ok(response["value"].clone())
    }

    fn get(&self, path: &str) -> Result<Value, CrawlError> {
        let response: Value = self
            .agent
            .get(&format!("{}{}", self.base, path))
            .call()
            .map_err(|e| transient(path, e))?
            .into_json()
            .map_err(|e| transient(path, e))?;
        Ok(response["value"].clone())
    }

    fn execute(&self, script: &str) -> Result<Value, CrawlError> {
        self.post("/execute/sync", json!({ "script": script, "args": [] }))
    }

    fn execute_bool(&self, script: &str) -> Result<bool, CrawlError> {
        Ok(self.execute(script)?.as_bool().unwrap_or(false))
    }

    fn find(&self, css: &str) -> Result<String, CrawlError> {
        let value = self.post(
            "/element",
            json!({ "using": "css selector", "value": css }),
        )?;
        value[ELEMENT_KEY]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CrawlError::Transient(format!("element not found: {}", css)))
    }

    /// Type one character at a time with short random pauses.
    fn type_slowly(&self, element: &str, text: &str) -> Result<(), CrawlError> {
        let pace = Duration::from_millis(50)..=Duration::from_millis(150);
        for ch in text.chars() {
            self.post(
                &format!("/element/{}/value", element),
                json!({ "text": ch.to_string() }),
            )?;
            pause(self.clock.as_ref(), super::human_delay(&pace), &self.stop)?;
        }
        Ok(())
    }

    fn current_url(&self) -> Result<String, CrawlError> {
        Ok(self.get("/url")?.as_str().unwrap_or_default().to_string())
    }
}

impl BrowserSession for WebDriverSession {
    fn navigate(&mut self, url: &str) -> Result<(), CrawlError> {
        debug!(url, "Navigating");
        self.post("/url", json!({ "url": url }))?;
        Ok(())
    }

    fn scroll(&mut self) -> Result<(), CrawlError> {
        self.execute(SCROLL_SCRIPT)?;
        Ok(())
    }

    fn extract_visible_pins(&mut self) -> Result<Vec<RawPin>, CrawlError> {
        let value = self.execute(EXTRACT_SCRIPT)?;
        serde_json::from_value(value).map_err(|e| transient("extract", e))
    }

    fn is_auth_wall_present(&mut self) -> Result<bool, CrawlError> {
        if is_login_url(&self.current_url()?) {
            return Ok(true);
        }
        self.execute_bool(AUTH_WALL_SCRIPT)
    }

    fn is_bot_challenge_present(&mut self) -> Result<bool, CrawlError> {
        self.execute_bool(BOT_CHALLENGE_SCRIPT)
    }

    fn is_end_of_board(&mut self) -> Result<bool, CrawlError> {
        self.execute_bool(END_MARKER_SCRIPT)
    }

    fn login(&mut self, credentials: &Credentials) -> Result<bool, CrawlError> {
        info!("Attempting login");
        self.navigate(LOGIN_URL)?;
        pause(self.clock.as_ref(), Duration::from_secs(4), &self.stop)?;

        let email = self.find("#email")?;
        self.type_slowly(&email, &credentials.email)?;
        let password = self.find("#password")?;
        self.type_slowly(&password, &credentials.password)?;
        let submit = self.find("[data-test-id='registerFormSubmitButton']")?;
        self.post(&format!("/element/{}/click", submit), json!({}))?;

        pause(self.clock.as_ref(), Duration::from_secs(6), &self.stop)?;
        let landed = self.current_url()?;
        if is_login_url(&landed) {
            warn!("Login did not complete, still on login page");
            return Ok(false);
        }
        info!("Logged in");
        Ok(true)
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Err(e) = self.agent.delete(&self.base).call() {
            debug!(error = %e, "Failed to close browser session");
        }
    }
}
