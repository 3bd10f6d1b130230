//! The Tortoise CRD conversion webhook.

use crate::k8s::tortoise::conversion;
use kube::core::{
    conversion::{ConversionRequest, ConversionResponse, ConversionReview},
    response::Status,
};
use tracing::{debug, info, warn};

/// Converts every object in `review` to the requested version. A single
/// failed object fails the whole review.
pub(crate) fn review(review: ConversionReview) -> ConversionReview {
    let req = match ConversionRequest::from_review(review) {
        Ok(req) => req,
        Err(error) => {
            warn!(%error, "Invalid conversion request");
            return ConversionResponse::invalid(Status::failure(
                &error.to_string(),
                "InvalidRequest",
            ))
            .into_review();
        }
    };

    let desired = req.desired_api_version.clone();
    let objects = req.objects.clone();
    debug!(%desired, objects = objects.len(), "Converting");
    let rsp = ConversionResponse::for_request(req);

    match objects
        .into_iter()
        .map(|obj| conversion::convert(obj, &desired))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(converted) => rsp.success(converted).into_review(),
        Err(error) => {
            info!(%error, %desired, "Conversion failed");
            rsp.failure(Status::failure(&error.to_string(), "ConversionFailed"))
                .into_review()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(desired: &str, objects: Vec<serde_json::Value>) -> ConversionReview {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview",
            "request": {
                "uid": "b3b1c1e4-0000-4000-8000-000000000001",
                "desiredAPIVersion": desired,
                "objects": objects,
            },
        }))
        .expect("review must parse")
    }

    fn tortoise(api_version: &str, kind: &str) -> serde_json::Value {
        json!({
            "apiVersion": api_version,
            "kind": "Tortoise",
            "metadata": { "name": "web", "namespace": "prod" },
            "spec": {
                "targetRefs": {
                    "scaleTargetRef": { "apiVersion": "apps/v1", "kind": kind, "name": "web" },
                },
                "updateMode": "Auto",
            },
        })
    }

    fn response(review: &ConversionReview) -> serde_json::Value {
        serde_json::to_value(review).expect("review must serialize")["response"].clone()
    }

    #[test]
    fn converts_hub_objects_down() {
        let out = review(request(
            "autoscaling.mercari.com/v1beta2",
            vec![tortoise("autoscaling.mercari.com/v1beta3", "Deployment")],
        ));
        let rsp = response(&out);
        assert_eq!(rsp["uid"], "b3b1c1e4-0000-4000-8000-000000000001");
        assert_eq!(rsp["result"]["status"], "Success");
        let obj = &rsp["convertedObjects"][0];
        assert_eq!(obj["apiVersion"], "autoscaling.mercari.com/v1beta2");
        assert_eq!(obj["spec"]["updateMode"], "Auto");
    }

    #[test]
    fn non_deployment_targets_fail_the_review() {
        let out = review(request(
            "autoscaling.mercari.com/v1beta2",
            vec![
                tortoise("autoscaling.mercari.com/v1beta3", "Deployment"),
                tortoise("autoscaling.mercari.com/v1beta3", "StatefulSet"),
            ],
        ));
        let rsp = response(&out);
        assert_eq!(rsp["result"]["status"], "Failure");
        assert_eq!(rsp["result"]["reason"], "ConversionFailed");
    }
}
