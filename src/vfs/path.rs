//! Host path resolution
//!
//! Host paths come either as `scheme://container/name` URLs or as absolute
//! mount-relative paths (`/container/name`). When the filesystem is bound to
//! a single container the whole path is the object name.

/// What a host path addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// The account: the list of containers
    Root,
    Container(String),
    /// An object or pseudo-directory inside a container
    Object { container: String, name: String },
}

impl Location {
    /// Container named by the location, if any
    pub fn container(&self) -> Option<&str> {
        match self {
            Location::Root => None,
            Location::Container(container) => Some(container),
            Location::Object { container, .. } => Some(container),
        }
    }
}

/// Maps host paths onto containers and object names
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    root_container: Option<String>,
}

impl PathResolver {
    pub fn new(root_container: Option<String>) -> Self {
        Self { root_container }
    }

    pub fn root_container(&self) -> Option<&str> {
        self.root_container.as_deref()
    }

    pub fn resolve(&self, path: &str) -> Location {
        let path = match path.split_once("://") {
            Some((_, rest)) => rest,
            None => path,
        };
        let path = path.trim_matches('/');

        if let Some(container) = &self.root_container {
            if path.is_empty() {
                return Location::Container(container.clone());
            }
            return Location::Object {
                container: container.clone(),
                name: path.to_string(),
            };
        }

        match path.split_once('/') {
            None if path.is_empty() => Location::Root,
            None => Location::Container(path.to_string()),
            Some((container, name)) => Location::Object {
                container: container.to_string(),
                name: name.trim_start_matches('/').to_string(),
            },
        }
    }
}
