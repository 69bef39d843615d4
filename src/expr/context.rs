//! Evaluation context construction from provider records.

use std::collections::BTreeMap;

use crate::provider::{Image, Instance};

use super::value::Value;

/// Builds the variable map for evaluating a filter against `instance`.
///
/// The instance is exposed under its provider field names; the resolved
/// image (which may be absent when the lookup failed) contributes the
/// `image_*` keys, and `has_public_net` carries the network-cache verdict.
#[must_use]
pub fn instance_context(
    instance: &Instance,
    image: Option<&Image>,
    has_public_net: bool,
) -> BTreeMap<String, Value> {
    let mut vars = BTreeMap::new();

    if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(instance) {
        for (key, value) in fields {
            vars.insert(key, Value::from(value));
        }
    }

    let str_of = |value: &str| Value::Str(value.to_owned());
    match image {
        Some(image) => {
            vars.insert(String::from("image_id"), str_of(&image.id));
            vars.insert(String::from("image_name"), str_of(&image.name));
            vars.insert(String::from("image_version"), str_of(&image.version));
            vars.insert(String::from("image_os"), str_of(&image.os));
            vars.insert(String::from("image_type"), str_of(&image.kind));
            vars.insert(String::from("image_state"), str_of(&image.state));
            vars.insert(String::from("image_public"), Value::Bool(image.public));
            vars.insert(String::from("image_owner"), str_of(&image.owner));
            vars.insert(
                String::from("image_published_at"),
                str_of(&image.published_at),
            );
            vars.insert(
                String::from("image_tags"),
                Value::Map(
                    image
                        .tags
                        .iter()
                        .map(|(key, value)| (key.clone(), Value::Str(value.clone())))
                        .collect(),
                ),
            );
        }
        None => {
            vars.insert(String::from("image_id"), str_of(&instance.image));
            for key in [
                "image_name",
                "image_version",
                "image_os",
                "image_type",
                "image_state",
                "image_owner",
                "image_published_at",
            ] {
                vars.insert(String::from(key), Value::Str(String::new()));
            }
            vars.insert(String::from("image_public"), Value::Bool(false));
            vars.insert(String::from("image_tags"), Value::Map(BTreeMap::new()));
        }
    }

    vars.insert(String::from("has_public_net"), Value::Bool(has_public_net));
    vars
}
