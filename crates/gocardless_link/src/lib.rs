use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    async_trait,
    extract::{Extension, FromRequest, RequestParts},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use lazy_static::lazy_static;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

pub const CALLBACK_PATH: &str = "/callback";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static CALLBACK_PAGE: &str = "<html><body><h1>Authorization Successful</h1>\
    <p>You can now close this window and return to the application.</p></body></html>";

static CALLBACK_ERROR_PAGE: &str = "<html><body><h1>Authorization Not Completed</h1>\
    <p>The bank reported an error. You can close this window and check the application \
    for details.</p></body></html>";

lazy_static! {
    // HACK: axum only hands us the path and query of the request uri. __Do not
    // depend on the host, scheme, or any non path part of the Url constructed
    // with this as a base.__
    static ref BASE_URL: Url = {
        Url::parse("http://localhost").unwrap()
    };
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("failed to bind callback listener")]
    Bind(#[source] hyper::Error),
    #[error("timed out after {0:?} waiting for authorization")]
    Timeout(Duration),
    #[error("authorization canceled")]
    Canceled,
    #[error("callback listener closed before authorization completed")]
    Closed,
}

impl IntoResponse for LinkError {
    fn into_response(self) -> Response {
        match self {
            LinkError::InvalidArgument(s) => (StatusCode::BAD_REQUEST, Html(s)),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html("something really bad happened".into()),
            ),
        }
        .into_response()
    }
}

/// Callback is the redirect the institution sends the user back with once
/// the authorization step is finished. Its arrival is the signal, the query
/// parameters are informational.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Callback {
    /// The requisition reference echoed back by the provider.
    pub reference: Option<String>,
    pub error: Option<String>,
    pub details: Option<String>,
}

#[async_trait]
impl<B> FromRequest<B> for Callback
where
    B: Send,
{
    type Rejection = LinkError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let url = Url::options()
            .base_url(Some(&BASE_URL))
            .parse(&req.uri().to_string())
            .map_err(|_| LinkError::InvalidArgument("invalid uri".into()))?;

        let param = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            reference: param("ref"),
            error: param("error"),
            details: param("details"),
        })
    }
}

/// CallbackServer is the local receiver the authorization redirect lands on.
/// The listener is bound when the server is created, so the redirect URL is
/// safe to hand out as soon as `bind` returns.
pub struct CallbackServer {
    addr: SocketAddr,
    listener: broadcast::Receiver<Callback>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Binds the listener and starts serving on the current tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, LinkError> {
        let (tx, rx) = broadcast::channel(4);
        let router = Router::new()
            .route(CALLBACK_PATH, get(receive_callback))
            .layer(Extension(tx));

        let server = axum::Server::try_bind(&addr)
            .map_err(LinkError::Bind)?
            .serve(router.into_make_service());
        let addr = server.local_addr();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                error!(%err, "callback server error");
            }
        });

        info!(%addr, "started callback server");

        Ok(Self {
            addr,
            listener: rx,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn callback_url(&self) -> String {
        format!("http://localhost:{}{}", self.addr.port(), CALLBACK_PATH)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Waits for the first of: a callback, `timeout` elapsing, or `cancel`
    /// firing. A callback that arrived before this call is not lost.
    pub async fn wait(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Callback, LinkError> {
        info!(?timeout, "waiting for authorization callback");

        let listener = &mut self.listener;
        let received = async move {
            loop {
                match listener.recv().await {
                    Ok(callback) => return Ok(callback),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(LinkError::Closed),
                }
            }
        };

        tokio::select! {
            biased;
            callback = received => callback,
            _ = cancel.cancelled() => Err(LinkError::Canceled),
            _ = tokio::time::sleep(timeout) => Err(LinkError::Timeout(timeout)),
        }
    }

    /// Stops the listener and waits for it to exit. Safe to call more than
    /// once.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            info!("shutting down callback server");
            let _ = tx.send(());
        }

        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Err(err)) => error!(%err, "callback server task failed"),
                Ok(Ok(())) => {}
                Err(_) => {
                    warn!("callback server did not drain in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn receive_callback(
    callback: Callback,
    on_callback: Extension<broadcast::Sender<Callback>>,
) -> Html<&'static str> {
    let page = match &callback.error {
        Some(err) => {
            warn!(
                reference = ?callback.reference,
                error = %err,
                details = ?callback.details,
                "authorization callback received with error"
            );
            CALLBACK_ERROR_PAGE
        }
        None => {
            info!(reference = ?callback.reference, "authorization callback received");
            CALLBACK_PAGE
        }
    };

    if on_callback.send(callback).is_err() {
        warn!("no listener waiting on authorization callback");
    }

    Html(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::RequestParts;
    use axum::http::Request;

    fn request_parts_from_uri(uri: &str) -> RequestParts<()> {
        RequestParts::new(Request::builder().uri(uri).body(()).unwrap())
    }

    #[tokio::test]
    async fn extract_callback_from_query() {
        let tests = vec![
            ("http://localhost:8080/callback", Callback::default()),
            (
                "http://localhost:8080/callback?ref=01GZ8V7Q",
                Callback {
                    reference: Some("01GZ8V7Q".to_string()),
                    ..Callback::default()
                },
            ),
            (
                "http://localhost:8080/callback?ref=abc&error=UserCancelledSession&details=User+cancelled",
                Callback {
                    reference: Some("abc".to_string()),
                    error: Some("UserCancelledSession".to_string()),
                    details: Some("User cancelled".to_string()),
                },
            ),
            (
                "http://localhost:8080/callback?ref=",
                Callback::default(),
            ),
        ];

        for t in tests {
            let mut req = request_parts_from_uri(t.0);
            assert_eq!(Callback::from_request(&mut req).await.unwrap(), t.1)
        }
    }

    #[tokio::test]
    async fn callback_url_uses_bound_port() {
        let mut server = CallbackServer::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let port = server.local_addr().port();

        assert_ne!(port, 0);
        assert_eq!(
            server.callback_url(),
            format!("http://localhost:{}/callback", port)
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn wait_times_out_without_callback() {
        let mut server = CallbackServer::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let cancel = CancellationToken::new();

        let err = server
            .wait(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));

        server.shutdown().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let mut server = CallbackServer::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = server
            .wait(Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Canceled));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mut server = CallbackServer::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

        server.shutdown().await;
        server.shutdown().await;
        assert!(!server.is_running());
    }
}
