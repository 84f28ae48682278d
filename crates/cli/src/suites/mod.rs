//! Registered end-to-end suites
//!
//! Each suite is one module run: its tests share a build, a server and a
//! browser pool sized for the most demanding test.

use anyhow::bail;

use ephemeral_harness::{TestSuite, WebDriverSession};

mod harness;
mod login;
mod no_ui;
mod post;

pub type Suite = TestSuite<WebDriverSession>;

/// Every suite, in registration order.
pub fn all() -> Vec<Suite> {
    vec![login::suite(), post::suite(), no_ui::suite(), harness::suite()]
}

/// The suites called `names`, in the order given; all of them when empty.
pub fn select(names: &[String]) -> anyhow::Result<Vec<Suite>> {
    let mut registered = all();
    if names.is_empty() {
        return Ok(registered);
    }

    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        match registered.iter().position(|suite| suite.name == name.as_str()) {
            Some(index) => selected.push(registered.remove(index)),
            None if selected.iter().any(|suite: &Suite| suite.name == name.as_str()) => {
                bail!("suite '{name}' was given more than once")
            }
            None => bail!(
                "unknown suite '{}' (available: {})",
                name,
                all().iter().map(|s| s.name).collect::<Vec<_>>().join(", ")
            ),
        }
    }
    Ok(selected)
}
