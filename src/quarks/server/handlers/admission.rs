/*
 * Copyright (C) 2024 The Quarks StatefulSet Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Mutating admission webhook for pods created by QuarksStatefulSet
//! StatefulSets.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::quarks::controller::pod_mutator;
use crate::quarks::k8s::pod::Pod;
use crate::quarks::logger::{log_debug, log_warn};

const COMPONENT: &str = "pod-mutator";
const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
const ADMISSION_KIND: &str = "AdmissionReview";
const PATCH_TYPE_JSON: &str = "JSONPatch";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    /// Base64-encoded JSON patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl AdmissionReview {
    fn answer(response: AdmissionResponse) -> Self {
        AdmissionReview {
            api_version: ADMISSION_API_VERSION.to_string(),
            kind: ADMISSION_KIND.to_string(),
            request: None,
            response: Some(response),
        }
    }
}

/// Pods are always admitted. Managed pods get a patch setting their ordinal
/// labels and pointing volumes at the shared claims.
pub fn review(request: &AdmissionRequest) -> AdmissionResponse {
    let mut response = AdmissionResponse {
        uid: request.uid.clone(),
        allowed: true,
        patch_type: None,
        patch: None,
    };

    let Some(object) = request.object.clone() else {
        return response;
    };
    let pod = match serde_json::from_value::<Pod>(object) {
        Ok(pod) => pod,
        Err(err) => {
            let error_text = err.to_string();
            log_warn(
                COMPONENT,
                "Admission object is not a pod; admitting unchanged",
                &[("uid", request.uid.as_str()), ("error", error_text.as_str())],
            );
            return response;
        }
    };

    let Some(mutated) = pod_mutator::mutate(&pod) else {
        return response;
    };
    let operations = pod_mutator::json_patch(&pod, &mutated);
    if operations.is_empty() {
        return response;
    }
    let patch = match serde_json::to_vec(&operations) {
        Ok(patch) => patch,
        Err(err) => {
            let error_text = err.to_string();
            log_warn(
                COMPONENT,
                "Failed to encode pod patch; admitting unchanged",
                &[("uid", request.uid.as_str()), ("error", error_text.as_str())],
            );
            return response;
        }
    };

    let pod_name = pod.metadata.name_or_empty();
    log_debug(
        COMPONENT,
        "Patching pod",
        &[("uid", request.uid.as_str()), ("pod", pod_name)],
    );
    response.patch_type = Some(PATCH_TYPE_JSON.to_string());
    response.patch = Some(STANDARD.encode(patch));
    response
}

pub(in crate::quarks::server) async fn mutate_pods(Json(review_request): Json<AdmissionReview>) -> Response {
    let Some(request) = review_request.request.as_ref() else {
        return (
            StatusCode::BAD_REQUEST,
            "admission review carries no request",
        )
            .into_response();
    };
    let response = review(request);
    (StatusCode::OK, Json(AdmissionReview::answer(response))).into_response()
}
