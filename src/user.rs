use std::collections::{HashMap, HashSet};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Value of a user attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, `i64` and `bool`.
///
/// ```
/// # use flagship::AttributeValue;
/// let string_attr: AttributeValue = "example".into();
/// let number_attr: AttributeValue = 42.0.into();
/// let bool_attr: AttributeValue = true.into();
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A list of values. Clauses match if any element matches.
    Array(Vec<AttributeValue>),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// The end user a flag is evaluated for.
///
/// The only mandatory property is the key, which must uniquely identify the user. Users are
/// immutable once built; use [`User::builder`] to set attributes.
///
/// ```
/// # use flagship::User;
/// let user = User::builder("user-123")
///     .country("NZ")
///     .custom("plan", "enterprise")
///     .build();
/// assert_eq!(user.key(), "user-123");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    anonymous: Option<bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    custom: HashMap<String, AttributeValue>,
    /// Attributes that must not leave the process in analytics events for this user.
    #[serde(skip)]
    private_attribute_names: HashSet<String>,
}

impl User {
    /// Create a user with only a key.
    pub fn new(key: impl Into<String>) -> User {
        User::builder(key).build()
    }

    /// Start building a user with the given key.
    pub fn builder(key: impl Into<String>) -> UserBuilder {
        UserBuilder {
            user: User {
                key: key.into(),
                secondary: None,
                ip: None,
                country: None,
                email: None,
                name: None,
                avatar: None,
                first_name: None,
                last_name: None,
                anonymous: None,
                custom: HashMap::new(),
                private_attribute_names: HashSet::new(),
            },
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    pub fn custom(&self) -> &HashMap<String, AttributeValue> {
        &self.custom
    }

    pub fn private_attribute_names(&self) -> &HashSet<String> {
        &self.private_attribute_names
    }

    /// Returns `true` if the key is empty or whitespace only.
    pub fn is_key_blank(&self) -> bool {
        self.key.trim().is_empty()
    }

    /// Look up an attribute by name for rule matching and bucketing.
    ///
    /// Built-in attributes are matched first; any other name is looked up in custom attributes.
    /// `secondary` is never available for evaluation.
    pub fn value_for_evaluation(&self, attribute: &str) -> Option<AttributeValue> {
        let builtin = |value: &Option<String>| value.as_deref().map(AttributeValue::from);
        match attribute {
            "key" => Some(AttributeValue::from(self.key.as_str())),
            "secondary" => None,
            "ip" => builtin(&self.ip),
            "country" => builtin(&self.country),
            "email" => builtin(&self.email),
            "name" => builtin(&self.name),
            "avatar" => builtin(&self.avatar),
            "firstName" => builtin(&self.first_name),
            "lastName" => builtin(&self.last_name),
            "anonymous" => self.anonymous.map(AttributeValue::Boolean),
            _ => self.custom.get(attribute).cloned(),
        }
    }
}

/// Builder for [`User`].
#[derive(Debug, Clone)]
pub struct UserBuilder {
    user: User,
}

impl UserBuilder {
    /// Secondary key, used only to break ties when bucketing.
    pub fn secondary(mut self, secondary: impl Into<String>) -> Self {
        self.user.secondary = Some(secondary.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.user.ip = Some(ip.into());
        self
    }

    /// Country as an ISO 3166-1 alpha-2 code.
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.user.country = Some(country.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.user.email = Some(email.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.user.name = Some(name.into());
        self
    }

    pub fn avatar(mut self, avatar: impl Into<String>) -> Self {
        self.user.avatar = Some(avatar.into());
        self
    }

    pub fn first_name(mut self, first_name: impl Into<String>) -> Self {
        self.user.first_name = Some(first_name.into());
        self
    }

    pub fn last_name(mut self, last_name: impl Into<String>) -> Self {
        self.user.last_name = Some(last_name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.user.anonymous = Some(anonymous);
        self
    }

    /// Set a custom attribute usable in rules and as a `bucketBy` attribute.
    pub fn custom(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.user.custom.insert(name.into(), value.into());
        self
    }

    /// Mark an attribute (built-in or custom) as private for this user.
    pub fn private_attribute(mut self, name: impl Into<String>) -> Self {
        self.user.private_attribute_names.insert(name.into());
        self
    }

    pub fn build(self) -> User {
        self.user
    }
}
