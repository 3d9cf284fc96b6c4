//! SpiceDB client over its HTTP/JSON gateway.

use async_trait::async_trait;
use relgate_core::{
    GraphError, Permissionship, PermissionGraph, Precondition, PreconditionKind,
    RelationshipFilter, RelationshipTuple, RelationshipWrite, SubjectRef, WriteOutcome,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// gRPC status code SpiceDB reports for a failed write precondition.
const FAILED_PRECONDITION: i64 = 9;

pub struct SpiceDbClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl SpiceDbClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, GraphError> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        request
            .send()
            .await
            .map_err(|e| GraphError::Unavailable(format!("POST {path}: {e}")))
    }

    /// Body of a successful response, or the gateway's error mapped to a [`GraphError`].
    async fn body(&self, path: &str, response: reqwest::Response) -> Result<String, GatewayFailure> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayFailure::Graph(GraphError::Unavailable(format!("{path}: {e}"))))?;
        if status.is_success() {
            return Ok(text);
        }
        let code = serde_json::from_str::<GatewayError>(&text).map(|e| e.code).unwrap_or(0);
        if code == FAILED_PRECONDITION {
            return Err(GatewayFailure::Precondition);
        }
        let message = format!("{path} returned {status}: {text}");
        Err(GatewayFailure::Graph(if is_transient(status) {
            GraphError::Unavailable(message)
        } else {
            GraphError::Rejected(message)
        }))
    }

    async fn call(&self, path: &str, body: &Value) -> Result<String, GraphError> {
        let response = self.post(path, body).await?;
        self.body(path, response).await.map_err(|f| match f {
            GatewayFailure::Graph(e) => e,
            GatewayFailure::Precondition => GraphError::Rejected(format!("{path}: failed precondition")),
        })
    }
}

enum GatewayFailure {
    Graph(GraphError),
    Precondition,
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    code: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectReference {
    object_type: String,
    object_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectReference {
    object: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    optional_relation: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Relationship {
    resource: ObjectReference,
    relation: String,
    subject: SubjectReference,
}

impl From<&RelationshipTuple> for Relationship {
    fn from(t: &RelationshipTuple) -> Self {
        Self {
            resource: ObjectReference { object_type: t.resource_type.clone(), object_id: t.resource_id.clone() },
            relation: t.relation.clone(),
            subject: subject(&t.subject()),
        }
    }
}

impl From<Relationship> for RelationshipTuple {
    fn from(r: Relationship) -> Self {
        RelationshipTuple::new(
            r.resource.object_type,
            r.resource.object_id,
            r.relation,
            r.subject.object.object_type,
            r.subject.object.object_id,
        )
    }
}

fn subject(s: &SubjectRef) -> SubjectReference {
    SubjectReference {
        object: ObjectReference { object_type: s.subject_type.clone(), object_id: s.subject_id.clone() },
        optional_relation: None,
    }
}

fn filter_json(filter: &RelationshipFilter) -> Value {
    let mut out = json!({ "resourceType": filter.resource_type.clone().unwrap_or_default() });
    if let Some(id) = &filter.resource_id {
        out["optionalResourceId"] = json!(id);
    }
    if let Some(rel) = &filter.relation {
        out["optionalRelation"] = json!(rel);
    }
    if let Some(st) = &filter.subject_type {
        let mut sf = json!({ "subjectType": st });
        if let Some(sid) = &filter.subject_id {
            sf["optionalSubjectId"] = json!(sid);
        }
        out["optionalSubjectFilter"] = sf;
    }
    out
}

fn precondition_json(p: &Precondition) -> Value {
    let operation = match p.kind {
        PreconditionKind::MustExist => "OPERATION_MUST_MATCH",
        PreconditionKind::MustNotExist => "OPERATION_MUST_NOT_MATCH",
    };
    json!({ "operation": operation, "filter": filter_json(&p.filter) })
}

fn fully_consistent() -> Value {
    json!({ "fullyConsistent": true })
}

/// Streamed gateway responses are one `{"result": ...}` or `{"error": ...}`
/// object per line.
fn stream_results<T: for<'de> Deserialize<'de>>(body: &str) -> Result<Vec<T>, GraphError> {
    #[derive(Deserialize)]
    struct Line<T> {
        result: Option<T>,
        error: Option<Value>,
    }
    let mut out = Vec::new();
    for raw in body.lines().filter(|l| !l.trim().is_empty()) {
        let line: Line<T> = serde_json::from_str(raw)
            .map_err(|e| GraphError::Rejected(format!("undecodable stream line: {e}")))?;
        if let Some(err) = line.error {
            return Err(GraphError::Rejected(format!("stream error: {err}")));
        }
        out.extend(line.result);
    }
    Ok(out)
}

#[async_trait]
impl PermissionGraph for SpiceDbClient {
    fn name(&self) -> &str {
        "spicedb"
    }

    async fn check(&self, tuple: &RelationshipTuple) -> Result<Permissionship, GraphError> {
        #[derive(Deserialize)]
        struct CheckResponse {
            permissionship: String,
        }
        let rel = Relationship::from(tuple);
        let body = json!({
            "consistency": fully_consistent(),
            "resource": rel.resource,
            "permission": rel.relation,
            "subject": rel.subject,
        });
        let text = self.call("/v1/permissions/check", &body).await?;
        let response: CheckResponse = serde_json::from_str(&text)
            .map_err(|e| GraphError::Rejected(format!("undecodable check response: {e}")))?;
        Ok(if response.permissionship == "PERMISSIONSHIP_HAS_PERMISSION" {
            Permissionship::Allowed
        } else {
            Permissionship::Denied
        })
    }

    async fn lookup_resources(
        &self,
        resource_type: &str,
        permission: &str,
        subject_ref: &SubjectRef,
        limit: Option<usize>,
    ) -> Result<Vec<String>, GraphError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LookupResult {
            resource_object_id: String,
        }
        let mut body = json!({
            "consistency": fully_consistent(),
            "resourceObjectType": resource_type,
            "permission": permission,
            "subject": subject(subject_ref),
        });
        if let Some(limit) = limit {
            body["optionalLimit"] = json!(limit);
        }
        let text = self.call("/v1/permissions/resources", &body).await?;
        let ids: Vec<String> = stream_results::<LookupResult>(&text)?
            .into_iter()
            .map(|r| r.resource_object_id)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        debug!(resource_type, permission, found = ids.len(), "SpiceDB lookup");
        Ok(ids)
    }

    async fn write_relationships(&self, write: &RelationshipWrite) -> Result<WriteOutcome, GraphError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct WriteResponse {
            written_at: Option<ZedToken>,
        }
        #[derive(Deserialize)]
        struct ZedToken {
            token: String,
        }

        let updates: Vec<Value> = write
            .deletes
            .iter()
            .map(|t| json!({ "operation": "OPERATION_DELETE", "relationship": Relationship::from(t) }))
            .chain(
                write
                    .creates
                    .iter()
                    .map(|t| json!({ "operation": "OPERATION_TOUCH", "relationship": Relationship::from(t) })),
            )
            .collect();
        let body = json!({
            "updates": updates,
            "optionalPreconditions": write.preconditions.iter().map(precondition_json).collect::<Vec<_>>(),
        });

        let path = "/v1/relationships/write";
        let response = self.post(path, &body).await?;
        match self.body(path, response).await {
            Ok(text) => {
                let parsed: WriteResponse = serde_json::from_str(&text)
                    .map_err(|e| GraphError::Rejected(format!("undecodable write response: {e}")))?;
                Ok(WriteOutcome::Committed {
                    revision: parsed.written_at.map(|t| t.token).unwrap_or_default(),
                })
            }
            // The gateway does not say which precondition failed; report the first.
            Err(GatewayFailure::Precondition) => match write.preconditions.first() {
                Some(p) => Ok(WriteOutcome::PreconditionFailed { precondition: p.clone() }),
                None => Err(GraphError::Rejected("failed precondition without preconditions".into())),
            },
            Err(GatewayFailure::Graph(e)) => Err(e),
        }
    }

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
        limit: Option<usize>,
    ) -> Result<Vec<RelationshipTuple>, GraphError> {
        #[derive(Deserialize)]
        struct ReadResult {
            relationship: Relationship,
        }
        let mut body = json!({
            "consistency": fully_consistent(),
            "relationshipFilter": filter_json(filter),
        });
        if let Some(limit) = limit {
            body["optionalLimit"] = json!(limit);
        }
        let text = self.call("/v1/relationships/read", &body).await?;
        Ok(stream_results::<ReadResult>(&text)?
            .into_iter()
            .map(|r| r.relationship.into())
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationship_wire_shape() {
        let t: RelationshipTuple = "pod:team-a/nginx#creator@user:alice".parse().unwrap();
        let v = serde_json::to_value(Relationship::from(&t)).unwrap();
        assert_eq!(v["resource"]["objectType"], "pod");
        assert_eq!(v["resource"]["objectId"], "team-a/nginx");
        assert_eq!(v["subject"]["object"]["objectId"], "alice");
        assert!(v["subject"].get("optionalRelation").is_none());
    }

    #[test]
    fn precondition_wire_shape() {
        let t: RelationshipTuple = "namespace:a#creator@user:bob".parse().unwrap();
        let v = precondition_json(&Precondition::must_not_exist(&t));
        assert_eq!(v["operation"], "OPERATION_MUST_NOT_MATCH");
        assert_eq!(v["filter"]["resourceType"], "namespace");
        assert_eq!(v["filter"]["optionalSubjectFilter"]["optionalSubjectId"], "bob");
    }

    #[test]
    fn parses_streamed_results() {
        let body = r#"{"result":{"lookedUpAt":{"token":"t"},"resourceObjectId":"a"}}
{"result":{"lookedUpAt":{"token":"t"},"resourceObjectId":"c"}}
"#;
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            resource_object_id: String,
        }
        let ids: Vec<String> = stream_results::<R>(body).unwrap().into_iter().map(|r| r.resource_object_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(stream_results::<R>(r#"{"error":{"code":5}}"#).is_err());
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(is_transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient(StatusCode::BAD_REQUEST));
    }
}
