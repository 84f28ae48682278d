//! `list` - show registered suites

use clap::Args;
use serde::Serialize;

use crate::output::{print_list, OutputFormat, TableDisplay};
use crate::suites::{self, Suite};

#[derive(Args)]
pub struct ListArgs {
    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// One registered test
#[derive(Debug, Serialize)]
pub struct TestListing {
    pub suite: &'static str,
    pub test: &'static str,
    pub clients: usize,
    pub rebuild: bool,
    pub server: bool,
}

impl TableDisplay for TestListing {
    fn headers() -> Vec<&'static str> {
        vec!["Suite", "Test", "Clients", "Rebuild", "Server"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.suite.to_string(),
            self.test.to_string(),
            self.clients.to_string(),
            yes_no(self.rebuild),
            yes_no(self.server),
        ]
    }
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}

pub fn listings(suites: &[Suite]) -> Vec<TestListing> {
    suites
        .iter()
        .flat_map(|suite| {
            suite.tests.iter().map(move |test| TestListing {
                suite: suite.name,
                test: test.name,
                clients: test.clients,
                rebuild: suite.config.rebuild_required,
                server: suite.config.server_required,
            })
        })
        .collect()
}

pub fn execute(args: ListArgs) {
    print_list(&listings(&suites::all()), args.format);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listings_cover_every_test() {
        let all = suites::all();
        let total: usize = all.iter().map(|s| s.tests.len()).sum();
        let rows = listings(&all);
        assert_eq!(rows.len(), total);

        let no_ui = rows.iter().find(|r| r.suite == "no_ui").unwrap();
        assert!(!no_ui.rebuild);
        assert!(no_ui.server);

        let two_clients = rows
            .iter()
            .find(|r| r.test == "test_post_is_visible_to_others")
            .unwrap();
        assert_eq!(two_clients.clients, 2);
    }
}
