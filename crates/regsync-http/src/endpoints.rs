//! Registry API paths. Ids are percent-encoded into a single path segment.

use urlencoding::encode;

/// Paged user listing, and the create target.
pub const USERS: &str = "/api/patient-registry/user";

/// Project listing. Returns a bare JSON array.
pub const PROJECTS: &str = "/api/patient-registry/project";

/// Paged subject listing.
pub const SUBJECTS: &str = "/api/v1/patient-registry/subject";

/// Paged document listing, filtered by `subjectId`.
pub const DOCUMENTS: &str = "/api/v1/patient-registry/document";

pub fn user(id: &str) -> String {
    format!("{}/{}", USERS, encode(id))
}

pub fn subject_concepts_status(subject_id: &str) -> String {
    format!("{}/{}/status/clinical-concepts", SUBJECTS, encode(subject_id))
}
