//! Path-template routing.
//!
//! Templates are slash-delimited; a segment is a literal, `{name}` /
//! `{name:str}` (one segment), `{name:int}` (digits), or `{name:path}`
//! (greedy, terminal). Matching walks a per-method tree, trying children in
//! priority order — literal, int, str, path — and backtracks to the next
//! lower-priority sibling on failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::error::{Error, Result};
use crate::handler::{Handler, WsHandler};
use crate::request::percent_decode;

/// Parameters captured from the matched route template.
#[derive(Clone, Debug, Default)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone)]
pub(crate) enum Endpoint {
    Http(Arc<dyn Handler>),
    Ws(Arc<dyn WsHandler>),
}

#[derive(Clone)]
pub(crate) struct Leaf {
    pub(crate) endpoint: Endpoint,
    pub(crate) template: Arc<str>,
}

/// Outcome of matching a (method, path) against the table.
pub(crate) enum RouteMatch {
    Found { leaf: Leaf, params: PathParams },
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

enum Segment {
    Literal(String),
    Int(String),
    Str(String),
    Path(String),
}

#[derive(Default)]
struct Node {
    literals: HashMap<String, Node>,
    int_child: Option<Box<(String, Node)>>,
    str_child: Option<Box<(String, Node)>>,
    path_leaf: Option<(String, Leaf)>,
    leaf: Option<Leaf>,
}

/// The route table. Built before serving, immutable afterwards.
#[derive(Default)]
pub struct Router {
    trees: HashMap<Method, Node>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Registers a handler for `method` at `template`.
    ///
    /// Fails if the pair is already registered or the template is malformed.
    pub fn route(
        &mut self,
        method: Method,
        template: &str,
        handler: impl Handler,
    ) -> Result<&mut Router> {
        self.insert(method, template, Endpoint::Http(Arc::new(handler)))?;
        Ok(self)
    }

    pub fn get(&mut self, template: &str, handler: impl Handler) -> Result<&mut Router> {
        self.route(Method::GET, template, handler)
    }

    pub fn post(&mut self, template: &str, handler: impl Handler) -> Result<&mut Router> {
        self.route(Method::POST, template, handler)
    }

    pub fn put(&mut self, template: &str, handler: impl Handler) -> Result<&mut Router> {
        self.route(Method::PUT, template, handler)
    }

    pub fn delete(&mut self, template: &str, handler: impl Handler) -> Result<&mut Router> {
        self.route(Method::DELETE, template, handler)
    }

    pub fn patch(&mut self, template: &str, handler: impl Handler) -> Result<&mut Router> {
        self.route(Method::PATCH, template, handler)
    }

    /// Registers a WebSocket endpoint. The route lives in the GET tree; a
    /// request reaching it without an upgrade is answered `426`.
    pub fn websocket(&mut self, template: &str, handler: impl WsHandler) -> Result<&mut Router> {
        self.insert(Method::GET, template, Endpoint::Ws(Arc::new(handler)))?;
        Ok(self)
    }

    fn insert(&mut self, method: Method, template: &str, endpoint: Endpoint) -> Result<()> {
        let segments = parse_template(template)?;
        let leaf = Leaf {
            endpoint,
            template: Arc::from(template),
        };

        let mut node = self.trees.entry(method).or_default();
        for (i, segment) in segments.iter().enumerate() {
            node = match segment {
                Segment::Literal(lit) => node.literals.entry(lit.clone()).or_default(),
                Segment::Int(name) => param_child(&mut node.int_child, name, template)?,
                Segment::Str(name) => param_child(&mut node.str_child, name, template)?,
                Segment::Path(name) => {
                    debug_assert_eq!(i, segments.len() - 1);
                    if node.path_leaf.is_some() {
                        return Err(Error::new_route_conflict(template));
                    }
                    node.path_leaf = Some((name.clone(), leaf));
                    return Ok(());
                }
            };
        }
        if node.leaf.is_some() {
            return Err(Error::new_route_conflict(template));
        }
        node.leaf = Some(leaf);
        Ok(())
    }

    /// Matches a request line against the table.
    ///
    /// Segments are percent-decoded after splitting, so an encoded slash
    /// never acts as a separator. `HEAD` falls back to the GET tree when it
    /// has no tree of its own.
    pub(crate) fn match_route(&self, method: &Method, path: &str) -> RouteMatch {
        let segments = match split_path(path) {
            Some(segments) => segments,
            None => return RouteMatch::NotFound,
        };

        let tree = match self.trees.get(method) {
            Some(tree) => Some(tree),
            None if *method == Method::HEAD => self.trees.get(&Method::GET),
            None => None,
        };
        if let Some(tree) = tree {
            let mut params = Vec::new();
            if let Some(leaf) = match_node(tree, &segments, &mut params) {
                return RouteMatch::Found {
                    leaf: leaf.clone(),
                    params: PathParams(params),
                };
            }
        }

        // Some other method may serve this path.
        let mut allowed: Vec<Method> = self
            .trees
            .iter()
            .filter(|(m, _)| *m != method)
            .filter(|(_, tree)| {
                let mut scratch = Vec::new();
                match_node(tree, &segments, &mut scratch).is_some()
            })
            .map(|(m, _)| m.clone())
            .collect();
        if allowed.is_empty() {
            RouteMatch::NotFound
        } else {
            if allowed.contains(&Method::GET) && !allowed.contains(&Method::HEAD) {
                allowed.push(Method::HEAD);
            }
            allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            RouteMatch::MethodNotAllowed(allowed)
        }
    }

    /// Matches an upgrade request against the WebSocket endpoints.
    pub(crate) fn match_websocket(&self, path: &str) -> Option<(Arc<dyn WsHandler>, PathParams)> {
        match self.match_route(&Method::GET, path) {
            RouteMatch::Found {
                leaf: Leaf {
                    endpoint: Endpoint::Ws(handler),
                    ..
                },
                params,
            } => Some((handler, params)),
            _ => None,
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.trees.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn param_child<'n>(
    slot: &'n mut Option<Box<(String, Node)>>,
    name: &str,
    template: &str,
) -> Result<&'n mut Node> {
    if let Some(boxed) = slot {
        if boxed.0 == name {
            return Ok(&mut boxed.1);
        }
        // A second parameter of the same type at this position must agree on
        // the capture name; otherwise the tables would be ambiguous.
        return Err(Error::new_route_conflict(template));
    }
    *slot = Some(Box::new((name.to_owned(), Node::default())));
    Ok(&mut slot.as_mut().expect("just inserted").1)
}

fn match_node<'n>(
    node: &'n Node,
    segments: &[String],
    params: &mut Vec<(String, String)>,
) -> Option<&'n Leaf> {
    let (seg, rest) = match segments.split_first() {
        None => return node.leaf.as_ref(),
        Some(split) => split,
    };

    if let Some(child) = node.literals.get(seg) {
        if let Some(leaf) = match_node(child, rest, params) {
            return Some(leaf);
        }
    }
    if let Some(boxed) = node.int_child.as_deref() {
        if !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()) {
            params.push((boxed.0.clone(), seg.clone()));
            if let Some(leaf) = match_node(&boxed.1, rest, params) {
                return Some(leaf);
            }
            params.pop();
        }
    }
    if let Some(boxed) = node.str_child.as_deref() {
        if !seg.is_empty() {
            params.push((boxed.0.clone(), seg.clone()));
            if let Some(leaf) = match_node(&boxed.1, rest, params) {
                return Some(leaf);
            }
            params.pop();
        }
    }
    if let Some((name, leaf)) = node.path_leaf.as_ref() {
        let mut captured = seg.clone();
        for s in rest {
            captured.push('/');
            captured.push_str(s);
        }
        params.push((name.clone(), captured));
        return Some(leaf);
    }
    None
}

/// Splits a request path into percent-decoded segments. The empty segment
/// from the leading `/` is dropped; decoding happens after splitting.
fn split_path(path: &str) -> Option<Vec<String>> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    trimmed
        .split('/')
        .map(|seg| {
            let decoded = percent_decode(seg.as_bytes())?;
            String::from_utf8(decoded).ok()
        })
        .collect()
}

fn parse_template(template: &str) -> Result<Vec<Segment>> {
    if !template.starts_with('/') {
        return Err(Error::new_config("route template must start with '/'"));
    }
    let trimmed = &template[1..];
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<&str> = trimmed.split('/').collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, part) in raw.iter().enumerate() {
        let segment = if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            let (name, kind) = match inner.split_once(':') {
                Some((name, kind)) => (name, kind),
                None => (inner, "str"),
            };
            if name.is_empty() {
                return Err(Error::new_config("route parameter has no name"));
            }
            match kind {
                "str" => Segment::Str(name.to_owned()),
                "int" => Segment::Int(name.to_owned()),
                "path" => {
                    if i != raw.len() - 1 {
                        return Err(Error::new_config(
                            "path-typed parameter must be the final segment",
                        ));
                    }
                    Segment::Path(name.to_owned())
                }
                _ => return Err(Error::new_config("unknown route parameter type")),
            }
        } else if part.contains('{') || part.contains('}') {
            return Err(Error::new_config("unbalanced braces in route template"));
        } else {
            Segment::Literal((*part).to_owned())
        };
        segments.push(segment);
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;

    fn h(tag: &'static str) -> impl Handler {
        move |_req| async move { Ok::<_, crate::HandlerError>(Response::text(tag)) }
    }

    fn found(router: &Router, method: Method, path: &str) -> Option<PathParams> {
        match router.match_route(&method, path) {
            RouteMatch::Found { params, .. } => Some(params),
            _ => None,
        }
    }

    #[test]
    fn literal_match() {
        let mut r = Router::new();
        r.get("/hello", h("hello")).unwrap();
        assert!(found(&r, Method::GET, "/hello").is_some());
        assert!(found(&r, Method::GET, "/nope").is_none());
    }

    #[test]
    fn root_route() {
        let mut r = Router::new();
        r.get("/", h("root")).unwrap();
        assert!(found(&r, Method::GET, "/").is_some());
    }

    #[test]
    fn int_param_captures() {
        let mut r = Router::new();
        r.get("/users/{id:int}", h("user")).unwrap();
        let params = found(&r, Method::GET, "/users/42").unwrap();
        assert_eq!(params.get("id"), Some("42"));
        assert!(found(&r, Method::GET, "/users/alice").is_none());
    }

    #[test]
    fn str_param_default() {
        let mut r = Router::new();
        r.get("/users/{name}", h("user")).unwrap();
        let params = found(&r, Method::GET, "/users/alice").unwrap();
        assert_eq!(params.get("name"), Some("alice"));
    }

    #[test]
    fn priority_literal_over_int_over_str() {
        let mut r = Router::new();
        r.get("/v/{s}", h("str")).unwrap();
        r.get("/v/{n:int}", h("int")).unwrap();
        r.get("/v/10", h("lit")).unwrap();

        // literal wins
        assert!(found(&r, Method::GET, "/v/10").unwrap().is_empty());
        // int beats str for digits
        let params = found(&r, Method::GET, "/v/7").unwrap();
        assert_eq!(params.get("n"), Some("7"));
        // str takes the rest
        let params = found(&r, Method::GET, "/v/abc").unwrap();
        assert_eq!(params.get("s"), Some("abc"));
    }

    #[test]
    fn backtracks_past_dead_literal() {
        let mut r = Router::new();
        r.get("/a/static/end", h("lit")).unwrap();
        r.get("/a/{x}/other", h("param")).unwrap();
        // "static" matches the literal child, which then dead-ends on
        // "other"; the matcher must back up and retry the str child.
        let params = found(&r, Method::GET, "/a/static/other").unwrap();
        assert_eq!(params.get("x"), Some("static"));
    }

    #[test]
    fn path_param_greedy() {
        let mut r = Router::new();
        r.get("/files/{rest:path}", h("files")).unwrap();
        let params = found(&r, Method::GET, "/files/a/b/c.txt").unwrap();
        assert_eq!(params.get("rest"), Some("a/b/c.txt"));
        // at least one segment is required
        assert!(found(&r, Method::GET, "/files").is_none());
    }

    #[test]
    fn path_param_must_be_terminal() {
        let mut r = Router::new();
        let err = r.get("/files/{rest:path}/x", h("files")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn encoded_slash_stays_in_segment() {
        let mut r = Router::new();
        r.get("/one/{seg}", h("seg")).unwrap();
        let params = found(&r, Method::GET, "/one/a%2Fb").unwrap();
        assert_eq!(params.get("seg"), Some("a/b"));
        // the decoded slash did not create a second segment
        assert!(found(&r, Method::GET, "/one/a/b").is_none());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let mut r = Router::new();
        r.get("/x", h("a")).unwrap();
        let err = r.get("/x", h("b")).unwrap_err();
        assert!(err.is_route_conflict());
    }

    #[test]
    fn mismatched_param_names_conflict() {
        let mut r = Router::new();
        r.get("/u/{id:int}/a", h("a")).unwrap();
        let err = r.get("/u/{uid:int}/b", h("b")).unwrap_err();
        assert!(err.is_route_conflict());
    }

    #[test]
    fn method_not_allowed_lists_alternatives() {
        let mut r = Router::new();
        r.get("/x", h("get")).unwrap();
        match r.match_route(&Method::POST, "/x") {
            RouteMatch::MethodNotAllowed(allowed) => {
                assert_eq!(allowed, [Method::GET, Method::HEAD]);
            }
            _ => panic!("expected MethodNotAllowed"),
        }
    }

    #[test]
    fn head_falls_back_to_get() {
        let mut r = Router::new();
        r.get("/x", h("get")).unwrap();
        assert!(found(&r, Method::HEAD, "/x").is_some());
    }

    #[test]
    fn rematch_is_deterministic() {
        let mut r = Router::new();
        r.get("/a/{x}/{y:int}", h("a")).unwrap();
        let p1 = found(&r, Method::GET, "/a/m/3").unwrap();
        let p2 = found(&r, Method::GET, "/a/m/3").unwrap();
        assert_eq!(p1.get("x"), p2.get("x"));
        assert_eq!(p1.get("y"), p2.get("y"));
    }
}
