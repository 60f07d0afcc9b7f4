//! Default page layouts staged alongside every new model-schema.

use serde_json::{json, Map, Value};

use crate::model::{generate_id, Id, ID_KEY, MODEL_SCHEMA_ID_KEY};

const MODEL_NAME: &str = "<MODEL_NAME>";
const MODEL_NAME_PLURAL: &str = "<MODEL_NAME_PLURAL>";
const MODEL_NAME_LOWER: &str = "<MODEL_NAME_LOWER>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageTemplate {
    List,
    Create,
    Edit,
    Delete,
}

impl PageTemplate {
    pub const ALL: [PageTemplate; 4] = [
        PageTemplate::List,
        PageTemplate::Create,
        PageTemplate::Edit,
        PageTemplate::Delete,
    ];

    pub fn page_name(&self) -> &'static str {
        match self {
            PageTemplate::List => "list",
            PageTemplate::Create => "create",
            PageTemplate::Edit => "edit",
            PageTemplate::Delete => "delete",
        }
    }

    /// Layout skeleton with placeholder tokens still in place
    pub fn skeleton(&self) -> Value {
        match self {
            PageTemplate::List => json!([
                {
                    "component": "core@Header",
                    "config": {
                        "title": "<MODEL_NAME_PLURAL>",
                        "tools": [{"text": "Create <MODEL_NAME>", "to": "<MODEL_NAME_LOWER>/create"}]
                    }
                },
                {
                    "component": "core@Table",
                    "config": {
                        "actions": [{"text": "View", "to": "<MODEL_NAME_LOWER>/<OBJECT_ID>"}]
                    }
                }
            ]),
            PageTemplate::Create => json!([
                {
                    "component": "core@Header",
                    "config": {"title": "Create <MODEL_NAME>"}
                },
                {
                    "component": "core@Form",
                    "config": {"to": "<MODEL_NAME_LOWER>/<OBJECT_ID>"}
                }
            ]),
            PageTemplate::Edit => json!([
                {
                    "component": "core@Header",
                    "config": {
                        "title": "Edit <MODEL_NAME>",
                        "tools": [{"text": "Delete <MODEL_NAME>", "to": "<MODEL_NAME_LOWER>/<OBJECT_ID>/delete"}]
                    }
                },
                {
                    "component": "core@Form",
                    "config": {"method": "PATCH"}
                }
            ]),
            PageTemplate::Delete => json!([
                {
                    "component": "core@Header",
                    "config": {
                        "title": "Delete <MODEL_NAME>",
                        "tools": [{"text": "Go Back", "to": "<MODEL_NAME_LOWER>/<OBJECT_ID>"}]
                    }
                },
                {
                    "component": "core@Form",
                    "config": {
                        "method": "DELETE",
                        "to": "<MODEL_NAME_LOWER>",
                        "submit_button_text": "Confirm Delete"
                    }
                }
            ]),
        }
    }

    /// Skeleton with the model name substituted and a fresh id on every component
    pub fn render_layout(&self, model_name: &str) -> Value {
        let mut layout = self.skeleton();
        substitute(&mut layout, model_name);
        if let Value::Array(components) = &mut layout {
            assign_component_ids(components);
        }
        layout
    }

    /// Full page syntax bound to a model-schema
    pub fn companion_page(&self, page_id: Id, model_schema_id: Id, model_name: &str) -> Value {
        let mut page = Map::new();
        page.insert(ID_KEY.to_string(), Value::String(page_id.to_string()));
        page.insert("page_name".to_string(), Value::String(self.page_name().to_string()));
        page.insert(
            MODEL_SCHEMA_ID_KEY.to_string(),
            Value::String(model_schema_id.to_string()),
        );
        page.insert("layout".to_string(), self.render_layout(model_name));
        Value::Object(page)
    }
}

fn substitute(value: &mut Value, model_name: &str) {
    match value {
        Value::String(s) => {
            if s.contains('<') {
                *s = s
                    .replace(MODEL_NAME_PLURAL, &format!("{}s", model_name))
                    .replace(MODEL_NAME_LOWER, &model_name.to_lowercase())
                    .replace(MODEL_NAME, model_name);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| substitute(item, model_name)),
        Value::Object(map) => map.values_mut().for_each(|item| substitute(item, model_name)),
        _ => {}
    }
}

fn assign_component_ids(components: &mut [Value]) {
    for component in components {
        let Some(object) = component.as_object_mut() else {
            continue;
        };
        object.insert(ID_KEY.to_string(), Value::String(generate_id().to_string()));
        if let Some(Value::Array(children)) = object
            .get_mut("config")
            .and_then(|config| config.get_mut("children"))
        {
            assign_component_ids(children);
        }
    }
}
