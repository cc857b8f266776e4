use std::{convert::Infallible, future::Future, io, path::Path, sync::Arc};

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use warp::{
    http::StatusCode,
    reject::{LengthRequired, MethodNotAllowed, PayloadTooLarge, UnsupportedMediaType},
    reply::{self, Reply},
    Filter, Rejection,
};

use crate::{
    config::Config,
    eligibility::Evaluator,
    patch::PatchDocument,
    pod::{NamespaceView, PodView},
    review::{AdmissionRequest, AdmissionResponse, AdmissionReviewRequest, EncodedPatch, API_VERSION},
    Error,
};

/// Same cap the API server applies to request bodies.
pub const MAX_BODY_BYTES: u64 = 3 * 1024 * 1024;

/// Everything a request handler may touch. Built once, never mutated.
#[derive(Debug)]
pub struct Injector {
    evaluator: Evaluator,
    patch: PatchDocument,
}

impl Injector {
    pub fn new(evaluator: Evaluator, patch: PatchDocument) -> Self {
        Injector { evaluator, patch }
    }

    pub fn review(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let pod = PodView::new(&req.object);
        let namespace = req
            .namespace_object
            .as_ref()
            .map(NamespaceView::new)
            .or_else(|| pod.embedded_namespace());

        let ns = req
            .namespace
            .as_deref()
            .or_else(|| pod.namespace())
            .unwrap_or("<none>");
        let name = req
            .name
            .as_deref()
            .or_else(|| pod.name())
            .unwrap_or("<unnamed>");
        info!(
            "reviewing {} on Pod {ns}/{name} (uid {}): annotations {}, namespace annotations {}",
            req.operation.as_deref().unwrap_or("request"),
            req.uid,
            display_annotations(pod.annotations()),
            display_annotations(namespace.and_then(|x| x.annotations())),
        );

        let verdict = self.evaluator.evaluate(pod, namespace);
        if !verdict.allowed() {
            info!("skipped injection into Pod {ns}/{name}: {}", verdict.reason);
            return AdmissionResponse::deny(req);
        }

        let res = finish(req, self.patch.encode());
        if res.patch().is_some() {
            info!("{}", injection_message(ns, name, &self.patch));
        }
        res
    }
}

fn injection_message(ns: &str, name: &str, patch: &PatchDocument) -> String {
    match serde_json::to_string(patch.patch()) {
        Ok(x) => format!("injecting proxy into Pod {ns}/{name}: {x}"),
        Err(e) => format!("injecting proxy into Pod {ns}/{name} (patch not printable: {e})"),
    }
}

/// Fails closed: no patch, no admission of the mutation.
fn finish(req: &AdmissionRequest, encoded: Result<String, Error>) -> AdmissionResponse {
    match encoded {
        Ok(patch) => AdmissionResponse::allow(req, EncodedPatch::json_patch(patch)),
        Err(e) => {
            error!("failed to encode patch for uid {}: {e}", req.uid);
            AdmissionResponse::deny(req)
        }
    }
}

fn display_annotations(annotations: Option<&Map<String, Value>>) -> String {
    annotations
        .and_then(|x| serde_json::to_string(x).ok())
        .unwrap_or_else(|| "{}".to_string())
}

/// PEM certificate chain and private key served by the listener.
pub struct TlsMaterial {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl TlsMaterial {
    pub async fn load(cert: &Path, key: &Path) -> Result<Self, Error> {
        let read = |path: &Path| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::TlsError(format!("failed to read {}: {e}", path.display())))
            }
        };
        Self::from_pem(read(cert).await?, read(key).await?)
    }

    pub fn from_pem(cert: Vec<u8>, key: Vec<u8>) -> Result<Self, Error> {
        let certs = rustls_pemfile::certs(&mut cert.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::TlsError(format!("unreadable certificate: {e}")))?;
        if certs.is_empty() {
            return Err(Error::TlsError("no certificate in PEM file".to_string()));
        }
        rustls_pemfile::private_key(&mut key.as_slice())
            .map_err(|e| Error::TlsError(format!("unreadable private key: {e}")))?
            .ok_or_else(|| Error::TlsError("no private key in PEM file".to_string()))?;
        Ok(TlsMaterial { cert, key })
    }
}

pub fn routes(
    injector: Arc<Injector>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    warp::path("mutate")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(warp::any().map(move || injector.clone()))
        .and_then(mutate_handler)
        .recover(handle_rejection)
        .with(warp::log("proxy_injector::access"))
}

pub async fn run_webhook(
    config: &Config,
    tls: TlsMaterial,
    injector: Arc<Injector>,
) -> Result<(), Error> {
    // rustls parses the certificate and key here, before anything is served
    let (bind, server) = warp::serve(routes(injector))
        .tls()
        .cert(tls.cert)
        .key(tls.key)
        .try_bind_with_graceful_shutdown(config.bind, shutdown_signal())
        .map_err(|e| Error::ListenError(format!("failed to serve on {}: {e}", config.bind)))?;

    info!("webhook listening on {bind}");
    server.await;
    info!("webhook stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {},
                    _ = signal_or_park("Ctrl-C", tokio::signal::ctrl_c()) => {},
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                signal_or_park("Ctrl-C", tokio::signal::ctrl_c()).await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal_or_park("Ctrl-C", tokio::signal::ctrl_c()).await;
    }
    info!("shutdown requested, draining connections");
}

/// Resolves when the signal arrives. A handler that could not be installed
/// never resolves, so it cannot trigger a shutdown by itself.
async fn signal_or_park(what: &str, signal: impl Future<Output = io::Result<()>>) {
    if let Err(e) = signal.await {
        warn!("failed to listen for {what}: {e}");
        std::future::pending::<()>().await;
    }
}

async fn mutate_handler(
    body: AdmissionReviewRequest,
    injector: Arc<Injector>,
) -> Result<reply::Response, Infallible> {
    if let Some(version) = body.api_version.as_deref().filter(|x| *x != API_VERSION) {
        debug!(
            "answering {version} {} as {API_VERSION}",
            body.kind.as_deref().unwrap_or("review")
        );
    }

    let req: AdmissionRequest = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            warn!("invalid request: {err}");
            return Ok(reply::with_status(err.to_string(), StatusCode::BAD_REQUEST).into_response());
        }
    };

    let res = injector.review(&req);
    Ok(reply::json(&res.into_review()).into_response())
}

async fn handle_rejection(err: Rejection) -> Result<reply::Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("invalid admission review: {e}"))
    } else if err.find::<PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "body too large".to_string())
    } else if err.find::<LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "content-length required".to_string())
    } else if err.find::<UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "expected application/json".to_string(),
        )
    } else if err.find::<MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        error!("unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };
    warn!("rejected request ({status}): {message}");
    Ok(reply::with_status(message, status).into_response())
}
