//! Runtime-safe names for managed containers and images
//!
//! Names keep only the first 8 characters of each identifier. Two projects
//! whose keys share an 8-character prefix map to the same container name;
//! the full keys live in the container labels.

/// Prefix of every managed container name
pub const CONTAINER_PREFIX: &str = "dockyard-";

/// Repository namespace of every managed image
pub const IMAGE_NAMESPACE: &str = "dockyard/";

/// Label carrying the full project key
pub const LABEL_PROJECT: &str = "dockyard.project";

/// Label carrying the full build key
pub const LABEL_BUILD: &str = "dockyard.build";

/// Number of identifier characters kept in names
pub const SHORT_ID_LEN: usize = 8;

/// First [`SHORT_ID_LEN`] characters of an identifier
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Container name for a project
pub fn container_name(project_id: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, short_id(project_id))
}

/// Image repository shared by every build of a project
pub fn image_repository(project_id: &str) -> String {
    format!("{}{}", IMAGE_NAMESPACE, short_id(project_id))
}

/// Image reference for one build of a project
pub fn image_name(project_id: &str, build_id: &str) -> String {
    format!("{}:{}", image_repository(project_id), short_id(build_id))
}
