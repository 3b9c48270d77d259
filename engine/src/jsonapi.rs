//! JSON:API boundary helpers.
//!
//! Server responses arrive as `{data, included}` envelopes of resource
//! objects. [`flatten_response`] turns them into flat per-object field maps
//! in model field names; [`render`] goes the other way for records.

use crate::error::{Error, Result};
use crate::id::{IdArena, Key};
use crate::record::Record;
use crate::schema::Schema;
use crate::TypeName;
use serde_json::{json, Map, Value as Json};
use std::collections::HashMap;

/// One flattened resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub ty: TypeName,
    pub id: Key,
    /// Attribute values and relationship targets keyed by model field name
    pub fields: Map<String, Json>,
}

/// Convert `snake_case` to `camelCase`.
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' && !out.is_empty() {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Flatten one envelope, or an array of envelopes, into resources.
///
/// Included resources come first, primary data last. A resource appearing
/// more than once is merged into a single entry. Types the schema does not
/// know are kept; the caller decides what to do with them.
pub fn flatten_response(schema: &Schema, response: &Json) -> Result<Vec<Resource>> {
    let mut out: Vec<Resource> = Vec::new();
    let mut seen: HashMap<(TypeName, Key), usize> = HashMap::new();
    let envelopes: Vec<&Json> = match response {
        Json::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for envelope in envelopes {
        let obj = envelope
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("JSON:API envelope must be an object".into()))?;
        for key in ["included", "data"] {
            match obj.get(key) {
                None | Some(Json::Null) => {}
                Some(Json::Array(items)) => {
                    for item in items {
                        flatten_resource(schema, item, &mut out, &mut seen)?;
                    }
                }
                Some(item) => flatten_resource(schema, item, &mut out, &mut seen)?,
            }
        }
    }
    Ok(out)
}

fn flatten_resource(
    schema: &Schema,
    resource: &Json,
    out: &mut Vec<Resource>,
    seen: &mut HashMap<(TypeName, Key), usize>,
) -> Result<()> {
    let obj = resource
        .as_object()
        .ok_or_else(|| Error::InvalidPayload("JSON:API resource must be an object".into()))?;
    let ty = obj
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::InvalidPayload("JSON:API resource has no type".into()))?
        .to_string();
    let id = obj
        .get("id")
        .and_then(Key::from_json)
        .ok_or_else(|| Error::InvalidPayload(format!("{} resource has no id", ty)))?;

    let model = schema.get_model(&ty);
    let field_name = |name: &str| -> String {
        match model {
            Some(m) if m.field_kind(name).is_none() => {
                let camel = snake_to_camel(name);
                if m.field_kind(&camel).is_some() {
                    camel
                } else {
                    name.to_string()
                }
            }
            _ => name.to_string(),
        }
    };

    let mut fields = Map::new();
    if let Some(Json::Object(attributes)) = obj.get("attributes") {
        for (name, value) in attributes {
            fields.insert(field_name(name), value.clone());
        }
    }
    if let Some(Json::Object(relationships)) = obj.get("relationships") {
        for (name, rel) in relationships {
            let Some(data) = rel.get("data") else {
                continue;
            };
            let data = match data {
                Json::Array(items) => Json::Array(items.iter().map(resource_ref).collect()),
                Json::Null => Json::Null,
                other => resource_ref(other),
            };
            fields.insert(field_name(name), data);
        }
    }

    match seen.get(&(ty.clone(), id.clone())) {
        Some(pos) => out[*pos].fields.extend(fields),
        None => {
            seen.insert((ty.clone(), id.clone()), out.len());
            out.push(Resource { ty, id, fields });
        }
    }
    Ok(())
}

fn resource_ref(item: &Json) -> Json {
    json!({"type": item.get("type").cloned().unwrap_or(Json::Null), "id": item.get("id").cloned().unwrap_or(Json::Null)})
}

/// The key of the first primary resource in a response, e.g. the id the
/// server assigned to a created object.
pub fn primary_key(response: &Json) -> Option<Key> {
    let data = response.get("data")?;
    let first = match data {
        Json::Array(items) => items.first()?,
        other => other,
    };
    first.get("id").and_then(Key::from_json)
}

/// Render records as a JSON:API document.
pub fn render(schema: &Schema, records: &[&Record], arena: &IdArena) -> Result<Json> {
    let mut data = Vec::with_capacity(records.len());
    for record in records {
        let model = schema.model(record.ty())?;
        data.push(model.record_to_json_api(record, arena));
    }
    Ok(json!({ "data": data }))
}
