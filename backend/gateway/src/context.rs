//! Building request contexts from parsed API requests and backend objects.

use relgate_core::{extract_path, ObjectName, RequestContext, ResourceKind, UserInfo, Verb};
use serde_json::Value;

/// One proxied API call, after path parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub verb: Verb,
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(verb: Verb, kind: ResourceKind) -> Self {
        Self { verb, kind, namespace: None, name: None, body: None }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Context for this request. A create without a path name takes the name
    /// from the body; declared object fields are read from the body.
    pub fn context(&self, user: UserInfo, declared: &[String]) -> RequestContext {
        let body_name = self
            .body
            .as_ref()
            .and_then(|b| b.pointer("/metadata/name"))
            .and_then(Value::as_str)
            .map(String::from);
        let ctx = RequestContext::new(self.verb, self.kind.clone(), user)
            .with_namespace(self.namespace.clone())
            .with_name(self.name.clone().or(body_name));
        match &self.body {
            Some(body) => with_object_fields(ctx, body, declared),
            None => ctx,
        }
    }
}

fn with_object_fields(mut ctx: RequestContext, object: &Value, declared: &[String]) -> RequestContext {
    ctx.fields.clear();
    for path in declared {
        if let Some(value) = extract_path(object, path) {
            ctx.fields.insert(path.clone(), value);
        }
    }
    ctx
}

/// `base` re-pointed at a backend object: its name, namespace and declared
/// fields replace the request's. `None` if the object carries no name.
pub fn object_context(base: &RequestContext, object: &Value, declared: &[String]) -> Option<RequestContext> {
    let name = ObjectName::from_object(object)?;
    Some(with_object_fields(base.for_object(&name), object, declared))
}
