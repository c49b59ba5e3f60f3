//! XEP-0004 data forms.
//!
//! Fields are a sum type with per-variant payloads; a single
//! [`Field::from_element`] dispatcher replaces parse-time subclass
//! selection.

use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormType {
    /// A request for data.
    Form,
    /// A submission of data.
    Submit,
    /// The submitter declines.
    Cancel,
    /// Result data.
    Result,
}

impl FormType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::Form => "form",
            FormType::Submit => "submit",
            FormType::Cancel => "cancel",
            FormType::Result => "result",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "form" => FormType::Form,
            "submit" => FormType::Submit,
            "cancel" => FormType::Cancel,
            "result" => FormType::Result,
            _ => return None,
        })
    }
}

/// One selectable `<option/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOption {
    pub label: Option<String>,
    pub value: String,
}

/// Field payload, tagged by the wire `type` attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(Option<bool>),
    Fixed(Vec<String>),
    Hidden(Option<String>),
    JidMulti(Vec<Jid>),
    JidSingle(Option<Jid>),
    ListMulti {
        options: Vec<FieldOption>,
        selected: Vec<String>,
    },
    ListSingle {
        options: Vec<FieldOption>,
        selected: Option<String>,
    },
    TextMulti(Vec<String>),
    TextPrivate(Option<String>),
    TextSingle(Option<String>),
}

impl FieldValue {
    /// The wire `type` attribute value.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Fixed(_) => "fixed",
            FieldValue::Hidden(_) => "hidden",
            FieldValue::JidMulti(_) => "jid-multi",
            FieldValue::JidSingle(_) => "jid-single",
            FieldValue::ListMulti { .. } => "list-multi",
            FieldValue::ListSingle { .. } => "list-single",
            FieldValue::TextMulti(_) => "text-multi",
            FieldValue::TextPrivate(_) => "text-private",
            FieldValue::TextSingle(_) => "text-single",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub var: Option<String>,
    pub label: Option<String>,
    pub required: bool,
    pub value: FieldValue,
}

impl Field {
    pub fn new(var: &str, value: FieldValue) -> Field {
        Field {
            var: Some(var.to_owned()),
            label: None,
            required: false,
            value,
        }
    }

    /// Parses a `<field/>` element, dispatching on its `type` attribute.
    /// A missing or unknown type reads as `text-single` per XEP-0004.
    pub fn from_element(field: &Element) -> Field {
        let values: Vec<String> = field
            .children()
            .filter(|c| c.is("value", ns::DATA_FORMS))
            .map(|c| c.text())
            .collect();
        let options: Vec<FieldOption> = field
            .children()
            .filter(|c| c.is("option", ns::DATA_FORMS))
            .map(|o| FieldOption {
                label: o.attr("label").map(str::to_owned),
                value: o
                    .child("value", ns::DATA_FORMS)
                    .map(|v| v.text())
                    .unwrap_or_default(),
            })
            .collect();

        let first = || values.first().cloned();
        let value = match field.attr("type").unwrap_or("text-single") {
            // Lenient boolean: everything except "0"/"false" is true,
            // matching what deployed form handlers emit.
            "boolean" => FieldValue::Boolean(
                first().map(|v| !matches!(v.as_str(), "0" | "false")),
            ),
            "fixed" => FieldValue::Fixed(values.clone()),
            "hidden" => FieldValue::Hidden(first()),
            "jid-multi" => FieldValue::JidMulti(
                values.iter().filter_map(|v| v.parse().ok()).collect(),
            ),
            "jid-single" => FieldValue::JidSingle(first().and_then(|v| v.parse().ok())),
            "list-multi" => FieldValue::ListMulti {
                options,
                selected: values.clone(),
            },
            "list-single" => FieldValue::ListSingle {
                options,
                selected: first(),
            },
            "text-multi" => FieldValue::TextMulti(values.clone()),
            "text-private" => FieldValue::TextPrivate(first()),
            _ => FieldValue::TextSingle(first()),
        };

        Field {
            var: field.attr("var").map(str::to_owned),
            label: field.attr("label").map(str::to_owned),
            required: field.child("required", ns::DATA_FORMS).is_some(),
            value,
        }
    }

    pub fn to_element(&self) -> Element {
        let mut field = Element::new("field", ns::DATA_FORMS);
        field.set_attr("type", self.value.type_name());
        if let Some(var) = &self.var {
            field.set_attr("var", var);
        }
        if let Some(label) = &self.label {
            field.set_attr("label", label);
        }
        if self.required {
            field.append_child(Element::new("required", ns::DATA_FORMS));
        }

        let push_value = |field: &mut Element, value: &str| {
            field.append_child(Element::new("value", ns::DATA_FORMS).with_text(value));
        };
        let push_options = |field: &mut Element, options: &[FieldOption]| {
            for option in options {
                let mut o = Element::new("option", ns::DATA_FORMS);
                if let Some(label) = &option.label {
                    o.set_attr("label", label);
                }
                o.append_child(Element::new("value", ns::DATA_FORMS).with_text(&option.value));
                field.append_child(o);
            }
        };

        match &self.value {
            FieldValue::Boolean(Some(b)) => push_value(&mut field, if *b { "1" } else { "0" }),
            FieldValue::Boolean(None) => {}
            FieldValue::Fixed(values) | FieldValue::TextMulti(values) => {
                for value in values {
                    push_value(&mut field, value);
                }
            }
            FieldValue::Hidden(value)
            | FieldValue::TextPrivate(value)
            | FieldValue::TextSingle(value) => {
                if let Some(value) = value {
                    push_value(&mut field, value);
                }
            }
            FieldValue::JidMulti(jids) => {
                for jid in jids {
                    push_value(&mut field, &jid.to_string());
                }
            }
            FieldValue::JidSingle(jid) => {
                if let Some(jid) = jid {
                    push_value(&mut field, &jid.to_string());
                }
            }
            FieldValue::ListMulti { options, selected } => {
                for value in selected {
                    push_value(&mut field, value);
                }
                push_options(&mut field, options);
            }
            FieldValue::ListSingle { options, selected } => {
                if let Some(value) = selected {
                    push_value(&mut field, value);
                }
                push_options(&mut field, options);
            }
        }
        field
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataForm {
    pub form_type: FormType,
    pub title: Option<String>,
    pub instructions: Option<String>,
    pub fields: Vec<Field>,
}

impl DataForm {
    pub fn new(form_type: FormType) -> DataForm {
        DataForm {
            form_type,
            title: None,
            instructions: None,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: Field) -> DataForm {
        self.fields.push(field);
        self
    }

    pub fn field(&self, var: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.var.as_deref() == Some(var))
    }

    pub fn from_element(x: &Element) -> Option<DataForm> {
        if !x.is("x", ns::DATA_FORMS) {
            return None;
        }
        let form_type = FormType::from_str(x.attr("type")?)?;
        Some(DataForm {
            form_type,
            title: x.child("title", ns::DATA_FORMS).map(|t| t.text()),
            instructions: x.child("instructions", ns::DATA_FORMS).map(|t| t.text()),
            fields: x
                .children()
                .filter(|c| c.is("field", ns::DATA_FORMS))
                .map(Field::from_element)
                .collect(),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut x = Element::new("x", ns::DATA_FORMS);
        x.set_attr("type", self.form_type.as_str());
        if let Some(title) = &self.title {
            x.append_child(Element::new("title", ns::DATA_FORMS).with_text(title));
        }
        if let Some(instructions) = &self.instructions {
            x.append_child(Element::new("instructions", ns::DATA_FORMS).with_text(instructions));
        }
        for field in &self.fields {
            x.append_child(field.to_element());
        }
        x
    }
}
