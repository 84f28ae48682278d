//! Identity acquisition through the login form

use std::fmt::Write as _;

use anyhow::ensure;
use futures::future::BoxFuture;
use futures::FutureExt;

use ephemeral_harness::client::IdentityMode;
use ephemeral_harness::{TestCase, TestInput, WebDriverSession};

use super::Suite;

/// Guest identities carry this prefix; persisted ones do not.
const EPHEMERAL_ID_PREFIX: &str = "e'";

pub fn suite() -> Suite {
    Suite::new("login")
        .test(TestCase::new("test_guest_login", guest_login).requires_clients(1))
        .test(TestCase::new("test_user_creation", user_creation).requires_clients(1))
        .test(TestCase::new("test_reuse_user", reuse_user).requires_clients(1))
}

fn guest_login(input: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        let guest = input.client(0)?;
        guest.login("guest", IdentityMode::Guest).await?;
        guest.wait_for_user_setup().await?;

        let id = guest.identity_id().await?;
        ensure!(id.starts_with(EPHEMERAL_ID_PREFIX), "guest id {id:?} is not ephemeral");
        Ok(())
    }
    .boxed()
}

fn user_creation(input: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        let user = input.client(0)?;
        user.login("user", IdentityMode::CreateId).await?;
        user.wait_for_user_setup().await?;

        let id = user.identity_id().await?;
        ensure!(!id.starts_with(EPHEMERAL_ID_PREFIX), "created id {id:?} is ephemeral");
        Ok(())
    }
    .boxed()
}

fn reuse_user(mut input: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        let user = input.client(0)?;
        user.login("user", IdentityMode::CreateId).await?;
        user.wait_for_user_setup().await?;
        let created_id = user.identity_id().await?;

        user.logout().await?;
        user.login("user", IdentityMode::ReuseId).await?;
        let reused_id = user.identity_id().await?;

        writeln!(input.out, "created {created_id}, reused {reused_id}")?;
        ensure!(reused_id == created_id, "reusing the identity produced a new id");
        Ok(())
    }
    .boxed()
}
