use http::Method;

/// A recognized request target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Root,
    Health,
    ListPolicies,
    CreatePolicies,
    DeletePolicies,
    Cleanup,
    Tags,
    Whoami,
    InternalPolicies,
    InternalCreateTag,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Recognized<'p> {
    Found {
        route: Route,
        version: Option<&'p str>,
    },
    MethodNotAllowed,
    NotFound,
}

/// A route table entry. A `{version}` segment matches any single segment and
/// is captured.
pub(crate) struct Entry {
    pub(crate) method: &'static str,
    pub(crate) path: &'static str,
    pub(crate) route: Route,
}

pub(crate) const EXTERNAL: &[Entry] = &[
    Entry::new("GET", "/", Route::Root),
    Entry::new("GET", "/health", Route::Health),
    Entry::new("GET", "/{version}/policies", Route::ListPolicies),
    Entry::new("POST", "/{version}/policies", Route::CreatePolicies),
    Entry::new("POST", "/{version}/policies/delete", Route::DeletePolicies),
    Entry::new("POST", "/{version}/policies/cleanup", Route::Cleanup),
    Entry::new("GET", "/{version}/tags", Route::Tags),
    Entry::new("GET", "/{version}/whoami", Route::Whoami),
];

pub(crate) const INTERNAL: &[Entry] = &[
    Entry::new("GET", "/health", Route::Health),
    Entry::new("GET", "/v1/internal/policies", Route::InternalPolicies),
    Entry::new("POST", "/v1/internal/tags", Route::InternalCreateTag),
];

// === impl Route ===

impl Route {
    /// A low-cardinality label for metrics and logs.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Health => "health",
            Self::ListPolicies => "list_policies",
            Self::CreatePolicies => "create_policies",
            Self::DeletePolicies => "delete_policies",
            Self::Cleanup => "cleanup",
            Self::Tags => "tags",
            Self::Whoami => "whoami",
            Self::InternalPolicies => "internal_policies",
            Self::InternalCreateTag => "internal_create_tag",
        }
    }
}

// === impl Entry ===

impl Entry {
    const fn new(method: &'static str, path: &'static str, route: Route) -> Self {
        Self {
            method,
            path,
            route,
        }
    }

    /// Matches `path` against this entry, returning the captured version
    /// segment, if any.
    fn capture<'p>(&self, path: &'p str) -> Option<Option<&'p str>> {
        let mut version = None;
        let mut pattern = self.path.split('/');
        let mut segments = path.split('/');
        loop {
            match (pattern.next(), segments.next()) {
                (None, None) => return Some(version),
                (Some("{version}"), Some(seg)) if !seg.is_empty() => version = Some(seg),
                (Some(p), Some(s)) if p == s => {}
                _ => return None,
            }
        }
    }
}

pub(crate) fn recognize<'p>(table: &[Entry], method: &Method, path: &'p str) -> Recognized<'p> {
    let mut path_matched = false;
    for entry in table {
        if let Some(version) = entry.capture(path) {
            if entry.method == method.as_str() {
                return Recognized::Found {
                    route: entry.route,
                    version,
                };
            }
            path_matched = true;
        }
    }
    if path_matched {
        Recognized::MethodNotAllowed
    } else {
        Recognized::NotFound
    }
}

/// Lists the methods the table serves at `path`, for preflight responses.
pub(crate) fn allowed_methods(table: &[Entry], path: &str) -> Vec<&'static str> {
    let mut methods = table
        .iter()
        .filter(|e| e.capture(path).is_some())
        .map(|e| e.method)
        .collect::<Vec<_>>();
    methods.dedup();
    methods
}
