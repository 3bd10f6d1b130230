use crate::{
    conversion,
    core::Config,
    k8s::Client,
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{
    core::{admission::Operation, conversion::ConversionReview, DynamicObject},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

mod hpa;
mod pod;
mod tortoise;

#[cfg(test)]
mod tests;

pub(crate) const MUTATE_TORTOISE: &str = "/mutate-autoscaling-mercari-com-v1beta3-tortoise";
pub(crate) const VALIDATE_TORTOISE: &str = "/validate-autoscaling-mercari-com-v1beta3-tortoise";
pub(crate) const MUTATE_HPA: &str = "/mutate-autoscaling-v2-horizontalpodautoscaler";
pub(crate) const VALIDATE_HPA: &str = "/validate-autoscaling-v2-horizontalpodautoscaler";
pub(crate) const MUTATE_POD: &str = "/mutate--v1-pod";
pub(crate) const CONVERT: &str = "/convert";

#[derive(Clone)]
pub struct Admission {
    client: Client,
    config: Arc<Config>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

/// Admits or denies an object. `new` is absent on delete and `old` on
/// create.
#[async_trait::async_trait]
trait Validate<T> {
    async fn validate(self, ns: &str, new: Option<T>, old: Option<T>) -> Result<()>;
}

/// Rewrites an object in place before it is persisted.
#[async_trait::async_trait]
trait Mutate<T> {
    async fn mutate(self, ns: &str, obj: &mut T) -> Result<()>;
}

/// Whether a failed mutation rejects the request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FailurePolicy {
    Fail,
    Ignore,
}

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let path = req.uri().path().to_string();
        if req.method() != http::Method::POST || !is_known(&path) {
            return Box::pin(future::ready(not_found()));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();

            if path == CONVERT {
                let review: ConversionReview = match serde_json::from_reader(bytes.reader()) {
                    Ok(review) => review,
                    Err(error) => {
                        warn!(%error, "Failed to parse conversion request body");
                        return bad_request();
                    }
                };
                return json_response(&conversion::review(review));
            }

            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(&AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(&path, req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(&rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    async fn admit(self, path: &str, req: AdmissionRequest) -> AdmissionResponse {
        use crate::k8s::{HorizontalPodAutoscaler, Pod, Tortoise};

        match path {
            MUTATE_TORTOISE if is_kind::<Tortoise>(&req) => {
                self.admit_mutate::<Tortoise>(req, FailurePolicy::Fail).await
            }
            VALIDATE_TORTOISE if is_kind::<Tortoise>(&req) => {
                self.admit_validate::<Tortoise>(req).await
            }
            MUTATE_HPA if is_kind::<HorizontalPodAutoscaler>(&req) => {
                self.admit_mutate::<HorizontalPodAutoscaler>(req, FailurePolicy::Fail)
                    .await
            }
            VALIDATE_HPA if is_kind::<HorizontalPodAutoscaler>(&req) => {
                self.admit_validate::<HorizontalPodAutoscaler>(req).await
            }
            MUTATE_POD if is_kind::<Pod>(&req) => {
                self.admit_mutate::<Pod>(req, FailurePolicy::Ignore).await
            }
            _ => AdmissionResponse::invalid(format_args!(
                "unsupported resource type on {path}: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            )),
        }
    }

    async fn admit_validate<T>(self, req: AdmissionRequest) -> AdmissionResponse
    where
        T: DeserializeOwned,
        Self: Validate<T>,
    {
        let rsp = AdmissionResponse::from(&req);
        let kind = req.kind.kind.clone();
        let ns = req.namespace.clone().unwrap_or_default();
        let name = req.name.clone();

        let parsed = (|| -> Result<_> {
            let new = req.object.as_ref().map(parse::<T>).transpose()?;
            let old = match req.operation {
                Operation::Create => None,
                _ => req.old_object.as_ref().map(parse::<T>).transpose()?,
            };
            Ok((new, old))
        })();
        let (new, old) = match parsed {
            Ok(objs) => objs,
            Err(error) => {
                info!(%error, "Failed to parse {}", kind);
                return rsp.deny(error);
            }
        };

        if let Err(error) = self.validate(&ns, new, old).await {
            info!(%error, %ns, %name, %kind, "Denied");
            return rsp.deny(error);
        }
        rsp
    }

    async fn admit_mutate<T>(
        self,
        req: AdmissionRequest,
        on_error: FailurePolicy,
    ) -> AdmissionResponse
    where
        T: DeserializeOwned + Serialize + Resource + Send,
        Self: Mutate<T>,
    {
        let rsp = AdmissionResponse::from(&req);
        let kind = req.kind.kind.clone();
        let ns = req.namespace.clone().unwrap_or_default();

        let res = async {
            let raw = req
                .object
                .as_ref()
                .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
            let raw = serde_json::to_value(raw)?;
            let mut obj = serde_json::from_value::<T>(raw.clone())?;
            self.mutate(&ns, &mut obj).await?;
            patch_for(&raw, &obj)
        }
        .await;

        match res {
            Ok(patch) if patch.0.is_empty() => rsp,
            Ok(patch) => {
                debug!(%ns, %kind, ops = patch.0.len(), "Mutated");
                match rsp.clone().with_patch(patch) {
                    Ok(rsp) => rsp,
                    Err(error) => fail(rsp, on_error, anyhow!(error), &kind),
                }
            }
            Err(error) => fail(rsp, on_error, error, &kind),
        }
    }
}

fn fail(
    rsp: AdmissionResponse,
    on_error: FailurePolicy,
    error: anyhow::Error,
    kind: &str,
) -> AdmissionResponse {
    match on_error {
        FailurePolicy::Fail => {
            info!(%error, %kind, "Denied");
            rsp.deny(error)
        }
        FailurePolicy::Ignore => {
            warn!(%error, %kind, "Admitting unchanged");
            rsp
        }
    }
}

/// A JSON patch from `raw` to `obj` covering the fields webhooks rewrite.
/// Only `spec` and `metadata.annotations` are compared so fields the typed
/// model does not know are left alone.
fn patch_for<T: Serialize>(raw: &serde_json::Value, obj: &T) -> Result<json_patch::Patch> {
    let typed = serde_json::to_value(obj)?;
    let mut want = raw.clone();
    if let Some(spec) = typed.get("spec") {
        want["spec"] = spec.clone();
    }
    match typed.pointer("/metadata/annotations") {
        Some(annots) => want["metadata"]["annotations"] = annots.clone(),
        None => {
            if let Some(meta) = want.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.remove("annotations");
            }
        }
    }
    Ok(json_patch::diff(raw, &want))
}

fn parse<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn is_known(path: &str) -> bool {
    matches!(
        path,
        MUTATE_TORTOISE | VALIDATE_TORTOISE | MUTATE_HPA | VALIDATE_HPA | MUTATE_POD | CONVERT
    )
}

fn json_response<T: Serialize>(rsp: &T) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn not_found() -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(http::StatusCode::NOT_FOUND)
        .body(Body::default())
        .expect("not found response must be valid"))
}

fn bad_request() -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(http::StatusCode::BAD_REQUEST)
        .body(Body::default())
        .expect("bad request response must be valid"))
}
