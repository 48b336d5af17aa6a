//! Borrowing an authenticated identity from the persistent browser profile.

use dialoguer::Confirm;
use livestat_core::SessionCredentials;
use tracing::{info, warn};

use crate::driver::{BrowserConfig, DriverError, PageDriver, WebDriverPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    LoggedIn,
    Declined,
}

/// Yes/no questions put to whoever is running the harvest.
pub trait Operator: Send + Sync {
    fn confirm(&self, prompt: &str, default: bool) -> bool;
}

/// Terminal prompt. A failed prompt (no TTY, interrupted) counts as "no".
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalOperator;

impl Operator for TerminalOperator {
    fn confirm(&self, prompt: &str, default: bool) -> bool {
        Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()
            .unwrap_or(false)
    }
}

/// Answers yes to everything; for unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Operator for AssumeYes {
    fn confirm(&self, _prompt: &str, _default: bool) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct SessionProvider {
    browser: BrowserConfig,
}

impl SessionProvider {
    pub fn new(browser: BrowserConfig) -> Self {
        Self { browser }
    }

    pub fn browser(&self) -> &BrowserConfig {
        &self.browser
    }

    /// Reads cookies and user-agent out of the profile. Any failure yields
    /// empty credentials; callers fall back to their seeded defaults.
    pub async fn acquire(&self, target_url: Option<&str>) -> SessionCredentials {
        match self.try_acquire(target_url).await {
            Ok(credentials) => {
                info!(
                    cookies = credentials.cookies.len(),
                    "session credentials read from browser profile"
                );
                credentials
            }
            Err(err) => {
                warn!(error = %err, "could not read session from browser profile");
                SessionCredentials::empty()
            }
        }
    }

    async fn try_acquire(&self, target_url: Option<&str>) -> Result<SessionCredentials, DriverError> {
        let page = WebDriverPage::launch(&self.browser, self.browser.headless).await?;
        let read = async {
            if let Some(url) = target_url {
                page.navigate(url).await?;
            }
            let mut credentials = SessionCredentials::empty();
            for (name, value) in page.cookies().await? {
                credentials.cookies.insert(name, value);
            }
            let user_agent = page.user_agent().await?;
            if !user_agent.is_empty() {
                credentials.headers.insert("User-Agent".to_string(), user_agent);
            }
            Ok::<_, DriverError>(credentials)
        }
        .await;
        if let Err(err) = page.close().await {
            warn!(error = %err, "closing browser after session read failed");
        }
        read
    }

    /// Gate before a run. If the operator says the profile is not logged in,
    /// a visible browser is opened on `login_url` until they confirm.
    pub async fn interactive_login(&self, login_url: &str, operator: &dyn Operator) -> LoginOutcome {
        if operator.confirm("Is the browser profile already logged in?", true) {
            return LoginOutcome::LoggedIn;
        }

        let page = match WebDriverPage::launch(&self.browser, false).await {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "could not open a browser for login");
                return LoginOutcome::Declined;
            }
        };
        if let Err(err) = page.navigate(login_url).await {
            warn!(url = login_url, error = %err, "opening login page failed");
        }
        info!(url = login_url, "complete the login in the opened browser window");

        let confirmed = operator.confirm("Finished logging in?", false);
        if let Err(err) = page.close().await {
            warn!(error = %err, "closing login browser failed");
        }
        if confirmed {
            info!(profile = %self.browser.profile_dir.display(), "login saved to browser profile");
            LoginOutcome::LoggedIn
        } else {
            LoginOutcome::Declined
        }
    }
}
