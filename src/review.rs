//! `admission.k8s.io/v1` envelope, trimmed to the fields this webhook reads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

pub const API_VERSION: &str = "admission.k8s.io/v1";
pub const KIND: &str = "AdmissionReview";
pub const PATCH_TYPE: &str = "JSONPatch";

/// Inbound review. `apiVersion` and `kind` are optional and never checked; the
/// answer is always a v1 review.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewRequest {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    pub request: Option<RawAdmissionRequest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAdmissionRequest {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    /// The owning Namespace object, when the caller chooses to send it.
    #[serde(default)]
    pub namespace_object: Option<Value>,
}

/// A request that passed envelope validation.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRequest {
    pub uid: String,
    pub object: Value,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub operation: Option<String>,
    pub namespace_object: Option<Value>,
}

impl TryFrom<AdmissionReviewRequest> for AdmissionRequest {
    type Error = Error;

    fn try_from(review: AdmissionReviewRequest) -> Result<Self, Self::Error> {
        let invalid = |msg: &str| Error::InvalidRequest(msg.to_string());

        let request = review.request.ok_or_else(|| invalid("missing request"))?;
        let uid = request
            .uid
            .filter(|x| !x.is_empty())
            .ok_or_else(|| invalid("missing request.uid"))?;
        let object = request
            .object
            .ok_or_else(|| invalid("missing request.object"))?;
        if !object.is_object() {
            return Err(invalid("request.object is not an object"));
        }

        Ok(AdmissionRequest {
            uid,
            object,
            namespace: request.namespace,
            name: request.name,
            operation: request.operation,
            namespace_object: request.namespace_object.filter(Value::is_object),
        })
    }
}

/// Base64 patch plus its type. Kept together so one cannot exist without the
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedPatch {
    pub patch: String,
    pub patch_type: &'static str,
}

impl EncodedPatch {
    pub fn json_patch(patch: String) -> Self {
        EncodedPatch {
            patch,
            patch_type: PATCH_TYPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(flatten)]
    patch: Option<EncodedPatch>,
}

impl AdmissionResponse {
    pub fn allow(request: &AdmissionRequest, patch: EncodedPatch) -> Self {
        AdmissionResponse {
            uid: request.uid.clone(),
            allowed: true,
            patch: Some(patch),
        }
    }

    pub fn deny(request: &AdmissionRequest) -> Self {
        AdmissionResponse {
            uid: request.uid.clone(),
            allowed: false,
            patch: None,
        }
    }

    pub fn patch(&self) -> Option<&EncodedPatch> {
        self.patch.as_ref()
    }

    pub fn into_review(self) -> AdmissionReviewResponse {
        AdmissionReviewResponse {
            api_version: API_VERSION,
            kind: KIND,
            response: self,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub response: AdmissionResponse,
}
