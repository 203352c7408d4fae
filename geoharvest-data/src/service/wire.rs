//! Response types for paged feature services.
//!
//! Both protocols answer feature requests with a GeoJSON-style feature
//! collection. ArcGIS REST services add `exceededTransferLimit` (at the top
//! level, or inside `properties` for `f=geojson` output); WFS 2.0 services
//! add a `links` array whose `rel = "next"` entry signals another page.

use serde::Deserialize;
use serde_json::Value;

/// One feature as returned by a service, before normalisation.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RawGeometryRecord {
    /// GeoJSON geometry object; `None` when absent or `null`.
    #[serde(default)]
    pub geometry: Option<Value>,
    /// Feature attributes.
    #[serde(default)]
    pub properties: Option<Value>,
}

/// A page of features.
#[derive(Debug, Deserialize)]
pub struct FeaturePage {
    /// Features on this page; absent on malformed responses.
    #[serde(default)]
    pub features: Option<Vec<RawGeometryRecord>>,

    /// ArcGIS transfer-limit flag at the top level.
    #[serde(default, rename = "exceededTransferLimit")]
    pub exceeded_transfer_limit: Option<bool>,

    /// Collection-level properties; ArcGIS GeoJSON output nests the
    /// transfer-limit flag here.
    #[serde(default)]
    pub properties: Option<PageProperties>,

    /// WFS link relations.
    #[serde(default)]
    pub links: Vec<Link>,

    /// Declared service error.
    #[serde(default)]
    pub error: Option<Value>,
}

impl FeaturePage {
    /// Whether the ArcGIS transfer limit was exceeded on this page.
    #[must_use]
    pub fn exceeded_transfer_limit(&self) -> bool {
        self.exceeded_transfer_limit
            .or_else(|| {
                self.properties
                    .as_ref()
                    .and_then(|properties| properties.exceeded_transfer_limit)
            })
            .unwrap_or(false)
    }

    /// Whether the page carries a `next` link.
    #[must_use]
    pub fn has_next_link(&self) -> bool {
        self.links.iter().any(|link| link.rel == "next")
    }
}

/// Collection-level properties of an ArcGIS GeoJSON page.
#[derive(Debug, Default, Deserialize)]
pub struct PageProperties {
    /// Transfer-limit flag.
    #[serde(default, rename = "exceededTransferLimit")]
    pub exceeded_transfer_limit: Option<bool>,
}

/// A WFS link relation.
#[derive(Debug, Deserialize)]
pub struct Link {
    /// Relation name, e.g. `next`. The target itself is never followed.
    #[serde(default)]
    pub rel: String,
}

/// ArcGIS `<service root>/layers` response.
#[derive(Debug, Deserialize)]
pub struct LayersResponse {
    /// Layers offered by the service.
    #[serde(default)]
    pub layers: Vec<LayerInfo>,
    /// Declared service error.
    #[serde(default)]
    pub error: Option<Value>,
}

/// One entry of [`LayersResponse::layers`].
#[derive(Debug, Clone, Deserialize)]
pub struct LayerInfo {
    /// Numeric layer identifier.
    pub id: i64,
    /// Human-readable layer name.
    pub name: String,
}

/// Extract `(code, message)` from a declared error value.
///
/// ArcGIS reports `{"code": 400, "message": "...", "details": [...]}`;
/// other services may report a bare string.
pub fn describe_error(error: &Value) -> (Option<i64>, String) {
    match error {
        Value::String(message) => (None, message.clone()),
        Value::Object(fields) => {
            let code = fields.get("code").and_then(Value::as_i64);
            let mut message = fields
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_owned();
            let details: Vec<&str> = fields
                .get("details")
                .and_then(Value::as_array)
                .map(|details| details.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if !details.is_empty() {
                message.push_str(" (");
                message.push_str(&details.join("; "));
                message.push(')');
            }
            (code, message)
        }
        other => (None, other.to_string()),
    }
}
