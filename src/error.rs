use thiserror::Error;

/// Error when not a single repository of the organisation could be cloned
#[derive(Debug, Error)]
#[error("{0}")]
pub struct NoRepositoriesFetched(pub String);

/// Error when a command needs an organisation and none was given
#[derive(Debug, Error)]
#[error(
    "an organisation is required for this command.\n\
     Pass it with --org <name>, or list the available ones with: relabel orgs"
)]
pub struct OrganisationRequired;
