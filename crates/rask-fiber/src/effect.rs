// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lazily-run fiber bodies.
//!
//! An `Effect` is a description of work: nothing happens until a runtime or
//! a running fiber forks it, at which point the body receives the new
//! fiber's `FiberContext` and is driven to completion on a scheduler.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::exit::{Cause, Defect, Exit};
use crate::fiber::FiberContext;

pub type BoxResultFuture<A, E> = Pin<Box<dyn Future<Output = Result<A, Cause<E>>> + Send>>;

type Body<A, E> = Box<dyn FnOnce(FiberContext) -> BoxResultFuture<A, E> + Send>;

pub struct Effect<A, E> {
    body: Body<A, E>,
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(FiberContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<A, Cause<E>>> + Send + 'static,
    {
        Effect {
            body: Box::new(move |cx| Box::pin(f(cx))),
        }
    }

    /// Body that never suspends.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce(&FiberContext) -> Result<A, Cause<E>> + Send + 'static,
    {
        Effect::new(move |cx| async move { f(&cx) })
    }

    pub fn succeed(value: A) -> Self {
        Effect::new(move |_| async move { Ok(value) })
    }

    pub fn fail(error: E) -> Self {
        Effect::fail_cause(Cause::fail(error))
    }

    pub fn fail_cause(cause: Cause<E>) -> Self {
        Effect::new(move |_| async move { Err(cause) })
    }

    pub fn die(defect: Defect) -> Self {
        Effect::fail_cause(Cause::die(defect))
    }

    pub fn from_exit(exit: Exit<A, E>) -> Self {
        Effect::new(move |_| async move { exit.into_result() })
    }

    pub fn map<B: Send + 'static>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E> {
        Effect::new(move |cx| async move { self.run(cx).await.map(f) })
    }

    pub fn map_err<F2: Send + 'static>(
        self,
        f: impl Fn(E) -> F2 + Copy + Send + 'static,
    ) -> Effect<A, F2> {
        Effect::new(move |cx| async move { self.run(cx).await.map_err(|cause| cause.map(f)) })
    }

    pub fn flat_map<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::new(move |cx| async move {
            let a = self.run(cx.clone()).await?;
            f(a).run(cx).await
        })
    }

    /// Run the body inline on the current fiber.
    pub fn run(self, cx: FiberContext) -> BoxResultFuture<A, E> {
        (self.body)(cx)
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Effect(..)")
    }
}
