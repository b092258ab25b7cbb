//! Tool catalog: which CRM operations are exposed to clients.

use serde::{Deserialize, Serialize};

/// CRM domains exposed by default.
pub const DEFAULT_DOMAINS: &[&str] = &["contacts", "companies", "deals", "tickets", "notes", "tasks"];

/// Operations available on every domain, with a description template.
const OPERATIONS: &[(&str, &str)] = &[
    ("list", "List {domain} records, optionally paginated"),
    ("get", "Fetch a single {domain} record by id"),
    ("create", "Create a new {domain} record"),
    ("update", "Update properties of an existing {domain} record"),
    ("delete", "Archive a {domain} record by id"),
    ("search", "Search {domain} records with filters"),
];

/// One domain operation exposed as a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub domain: String,
    pub operation: String,
    pub description: String,
}

impl ToolSpec {
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        operation: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            operation: operation.into(),
            description: description.into(),
        }
    }

    /// Tool name as seen by clients, e.g. `contacts_create`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}_{}", self.domain, self.operation)
    }
}

/// CRUD tools for the given domains.
#[must_use]
pub fn catalog_for<S: AsRef<str>>(domains: &[S]) -> Vec<ToolSpec> {
    domains
        .iter()
        .flat_map(|domain| {
            let domain = domain.as_ref();
            OPERATIONS.iter().map(move |(operation, template)| {
                ToolSpec::new(domain, *operation, template.replace("{domain}", domain))
            })
        })
        .collect()
}

/// CRUD tools for `DEFAULT_DOMAINS`.
#[must_use]
pub fn default_catalog() -> Vec<ToolSpec> {
    catalog_for(DEFAULT_DOMAINS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_covers_every_domain() {
        let catalog = default_catalog();
        assert_eq!(catalog.len(), DEFAULT_DOMAINS.len() * OPERATIONS.len());
        assert!(catalog.iter().any(|t| t.name() == "contacts_create"));
        assert!(catalog.iter().any(|t| t.name() == "tasks_search"));
    }

    #[test]
    fn descriptions_name_the_domain() {
        let catalog = catalog_for(&["leads"]);
        let get = catalog.iter().find(|t| t.operation == "get").unwrap();
        assert_eq!(get.description, "Fetch a single leads record by id");
    }
}
