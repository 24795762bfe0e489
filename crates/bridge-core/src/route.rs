use std::collections::BTreeMap;

/// Attributes extracted by a binding from the begin of a new stream
/// (for example a gRPC service and method), against which routes are matched.
pub type Attributes = BTreeMap<String, String>;

/// Resolve a route for a new stream. By default the route is the id used
/// as the `routed_id` of the delegate stream, and is otherwise opaque.
/// Bindings which need parameters of the route resolve to a richer `R`.
pub trait Resolve<R = u64>: Send + Sync {
    fn resolve(&self, authorization: u64, attributes: &Attributes) -> Option<R>;
}

impl<F, R> Resolve<R> for F
where
    F: Fn(u64, &Attributes) -> Option<R> + Send + Sync,
{
    fn resolve(&self, authorization: u64, attributes: &Attributes) -> Option<R> {
        self(authorization, attributes)
    }
}

/// Route to `id` when any of its `when` conditions match.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Route {
    pub id: u64,
    /// Conditions of the route, any one of which must match.
    /// A condition matches if each of its attributes is present with an equal value.
    /// A route without conditions matches everything.
    #[serde(default)]
    pub when: Vec<Attributes>,
    /// When set, the stream's authorization must include these bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guarded: Option<u64>,
}

impl Route {
    pub fn matches(&self, authorization: u64, attributes: &Attributes) -> bool {
        if let Some(guard) = self.guarded {
            if authorization & guard != guard {
                return false;
            }
        }
        self.when.is_empty()
            || self.when.iter().any(|condition| {
                condition
                    .iter()
                    .all(|(name, value)| attributes.get(name) == Some(value))
            })
    }
}

/// RouteTable resolves to the first of its routes which matches.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct RouteTable(pub Vec<Route>);

impl Resolve for RouteTable {
    fn resolve(&self, authorization: u64, attributes: &Attributes) -> Option<u64> {
        self.0
            .iter()
            .find(|route| route.matches(authorization, attributes))
            .map(|route| route.id)
    }
}

/// Build Attributes from name/value pairs.
pub fn attributes<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Attributes {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
