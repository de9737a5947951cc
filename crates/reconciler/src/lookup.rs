//! Read-only lookups of existing resources by name.
//!
//! A lookup never creates, changes or records anything. Names match exactly,
//! and exactly one resource must match.

use labsync_remote::types::Project;
use tracing::{debug, info};

use crate::context::ProviderContext;
use crate::error::{Error, Result};
use crate::resources::require_non_blank;
use crate::types::ResourceKind;

/// Find the single project called `name`.
///
/// # Errors
///
/// - [`Error::InvalidDesiredState`] for a blank name
/// - [`Error::NotFound`] when no project has the name
/// - [`Error::Ambiguous`] when more than one does
/// - the list failure otherwise
pub async fn find_project(ctx: &ProviderContext, name: &str) -> Result<Project> {
    require_non_blank(ResourceKind::Project, "name", name)?;
    let projects = ctx
        .service()
        .list_projects()
        .await
        .map_err(|e| Error::remote("list projects", e))?;
    debug!(name, listed = projects.len(), "Looking up project by name");

    let mut matches: Vec<Project> = projects
        .into_iter()
        .filter(|project| project.name == name)
        .collect();
    let count = matches.len();
    match matches.pop() {
        None => Err(Error::not_found(format!("project named {name}"))),
        Some(project) if count == 1 => {
            info!(id = %project.id, name, "Found project");
            Ok(project)
        }
        Some(_) => Err(Error::ambiguous(format!("project named {name}"), count)),
    }
}
