//! Posting and seeing posts from other peers

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{ensure, Context};
use futures::future::BoxFuture;
use futures::FutureExt;

use ephemeral_harness::client::IdentityMode;
use ephemeral_harness::{TestCase, TestInput, WebDriverSession};

use super::Suite;

/// How long a second peer gets to receive a post.
const PROPAGATION_WAIT: Duration = Duration::from_secs(5);

pub fn suite() -> Suite {
    Suite::new("post")
        .test(TestCase::new("test_post_is_visible_to_self", visible_to_self).requires_clients(1))
        .test(TestCase::new("test_post_is_visible_to_others", visible_to_others).requires_clients(2))
}

fn visible_to_self(mut input: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        let guest = input.client(0)?;
        guest.login("guest", IdentityMode::Guest).await?;
        let before = guest.posts().await?;
        ensure!(before.is_empty(), "fresh identity already sees posts: {before:?}");

        guest.new_post("hi").await?;
        let after = guest.posts().await?;
        let post = after.first().context("new post was not rendered")?;

        writeln!(input.out, "{}", post.contents)?;
        ensure!(post.contents == "hi", "post contents were {:?}", post.contents);
        Ok(())
    }
    .boxed()
}

fn visible_to_others(input: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        let author = input.client(0)?;
        author.login("guest", IdentityMode::Guest).await?;
        author.new_post("hi").await?;

        let reader = input.client(1)?;
        reader.login("guest1", IdentityMode::Guest).await?;
        tokio::time::sleep(PROPAGATION_WAIT).await;

        let posts = reader.posts().await?;
        ensure!(posts.len() == 1, "second peer sees {posts:?}");
        Ok(())
    }
    .boxed()
}
