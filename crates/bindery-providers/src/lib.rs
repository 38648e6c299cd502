pub mod git;
pub mod github;

use bindery_core::config::Config;
use bindery_core::provider::RepoProviders;

/// The default provider map: prefix → factory.
pub fn default_providers(config: &Config) -> RepoProviders {
    let mut providers = RepoProviders::new();
    providers.insert("gh".to_string(), github::GitHubProvider::factory(config));
    providers.insert("git".to_string(), git::GitProvider::factory(config));
    providers
}
