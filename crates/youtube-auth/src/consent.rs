//! Interactive consent flows
//!
//! The only step in resolution that waits on a human. A flow shows the
//! authorization URL, waits for the provider to hand back an authorization
//! code, and reports the redirect URI it used (the code exchange must repeat
//! it exactly).
//!
//! - `LoopbackConsent` listens on 127.0.0.1 and catches the browser redirect.
//! - `ConsoleConsent` asks the user to paste the code on stdin, for headless
//!   machines where the browser runs elsewhere.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::identity::InstalledApp;
use crate::pkce::build_authorization_url;

/// Everything a flow needs to build the consent URL.
pub struct ConsentRequest<'a> {
    pub app: &'a InstalledApp,
    pub scopes: &'a [&'a str],
    pub state: &'a str,
    pub challenge: &'a str,
}

/// Authorization code returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentGrant {
    pub code: String,
    pub redirect_uri: String,
}

/// A way of obtaining an authorization code from the user.
///
/// Uses `Pin<Box<dyn Future>>` return types so managers can hold a
/// `Box<dyn ConsentFlow>` chosen at runtime from configuration.
pub trait ConsentFlow: Send + Sync {
    /// Identifier for logging (e.g. "loopback", "console")
    fn id(&self) -> &str;

    /// Block until the user grants or declines consent.
    ///
    /// Declines, state mismatches and I/O failures are all `Authorization`.
    fn obtain_code<'a>(
        &'a self,
        request: ConsentRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<ConsentGrant>> + Send + 'a>>;
}

fn announce(flow: &str, url: &str) {
    info!(flow, "waiting for interactive authorization");
    eprintln!("\nOpen this URL in a browser to authorize uploads:\n\n  {url}\n");
}

/// Catches the provider redirect on a loopback listener.
#[derive(Debug, Clone)]
pub struct LoopbackConsent {
    port: u16,
    timeout: Option<Duration>,
}

impl LoopbackConsent {
    /// `port` 0 picks an ephemeral port. `timeout` `None` waits indefinitely.
    pub fn new(port: u16, timeout: Option<Duration>) -> Self {
        Self { port, timeout }
    }
}

impl ConsentFlow for LoopbackConsent {
    fn id(&self) -> &str {
        "loopback"
    }

    fn obtain_code<'a>(
        &'a self,
        request: ConsentRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<ConsentGrant>> + Send + 'a>> {
        Box::pin(async move {
            let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)))
                .await
                .map_err(|e| Error::Authorization(format!("binding loopback listener: {e}")))?;
            let addr = listener
                .local_addr()
                .map_err(|e| Error::Authorization(format!("loopback listener address: {e}")))?;
            let redirect_uri = format!("http://{addr}/");

            let url = build_authorization_url(
                request.app,
                &redirect_uri,
                request.scopes,
                request.state,
                request.challenge,
            )?;
            announce(self.id(), &url);

            let params = wait_for_callback(listener, self.timeout).await?;
            let code = params.into_code(request.state)?;
            info!(flow = self.id(), "authorization code received");
            Ok(ConsentGrant { code, redirect_uri })
        })
    }
}

/// Query parameters the provider appends to the redirect URI.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// Extract the code, rejecting declines and mismatched `state`.
    pub fn into_code(self, expected_state: &str) -> Result<String> {
        if let Some(error) = self.error {
            return Err(Error::Authorization(format!(
                "authorization declined: {error}"
            )));
        }
        if self.state.as_deref() != Some(expected_state) {
            return Err(Error::Authorization(
                "state mismatch in authorization callback".into(),
            ));
        }
        self.code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Authorization("callback carried no authorization code".into()))
    }
}

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

/// Serve the loopback redirect until one callback carrying `code` or `error`
/// arrives, then shut the listener down.
pub async fn wait_for_callback(
    listener: TcpListener,
    timeout: Option<Duration>,
) -> Result<CallbackParams> {
    let (tx, rx) = oneshot::channel::<CallbackParams>();
    let slot: CallbackSlot = Arc::new(Mutex::new(Some(tx)));
    let app = Router::new()
        .route("/", get(callback_handler))
        .with_state(slot);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let received = match timeout {
        Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
            Error::Authorization(format!(
                "no authorization callback within {}s",
                limit.as_secs()
            ))
        }),
        None => Ok(rx.await),
    };

    let _ = shutdown_tx.send(());
    if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
        warn!("loopback listener did not drain within 5s");
    }

    received?.map_err(|_| Error::Authorization("loopback listener closed".into()))
}

async fn callback_handler(
    State(slot): State<CallbackSlot>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    if params.code.is_none() && params.error.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Html("Missing authorization code."),
        );
    }

    let message = if params.error.is_some() {
        "Authorization was declined. You can close this window."
    } else {
        "Authorization received. You can close this window."
    };

    let sender = slot.lock().ok().and_then(|mut s| s.take());
    match sender {
        Some(tx) => {
            let _ = tx.send(params);
            (StatusCode::OK, Html(message))
        }
        None => (
            StatusCode::CONFLICT,
            Html("Authorization already completed."),
        ),
    }
}

/// Asks for the authorization code on stdin.
#[derive(Debug, Clone, Default)]
pub struct ConsoleConsent {
    redirect_uri: Option<String>,
}

impl ConsoleConsent {
    /// `redirect_uri` overrides the identity's first registered redirect URI.
    pub fn new(redirect_uri: Option<String>) -> Self {
        Self { redirect_uri }
    }
}

impl ConsentFlow for ConsoleConsent {
    fn id(&self) -> &str {
        "console"
    }

    fn obtain_code<'a>(
        &'a self,
        request: ConsentRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<ConsentGrant>> + Send + 'a>> {
        Box::pin(async move {
            let redirect_uri = self
                .redirect_uri
                .clone()
                .or_else(|| request.app.redirect_uris.first().cloned())
                .ok_or_else(|| {
                    Error::Authorization("identity document lists no redirect_uris".into())
                })?;

            let url = build_authorization_url(
                request.app,
                &redirect_uri,
                request.scopes,
                request.state,
                request.challenge,
            )?;
            announce(self.id(), &url);
            eprint!("Paste the authorization code (or the full redirect URL): ");

            let mut line = String::new();
            BufReader::new(tokio::io::stdin())
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Authorization(format!("reading authorization code: {e}")))?;

            let code = parse_pasted_code(&line, request.state)?;
            Ok(ConsentGrant { code, redirect_uri })
        })
    }
}

/// Accept either a bare code (optionally with a `#state` suffix) or the full
/// redirect URL copied from the browser address bar.
pub fn parse_pasted_code(input: &str, expected_state: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Authorization("no authorization code entered".into()));
    }

    if let Ok(url) = reqwest::Url::parse(input)
        && url.query().is_some()
    {
        let mut params = CallbackParams::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
        return params.into_code(expected_state);
    }

    let code = input.split('#').next().unwrap_or(input).trim();
    if code.is_empty() {
        return Err(Error::Authorization("no authorization code entered".into()));
    }
    Ok(code.to_string())
}
