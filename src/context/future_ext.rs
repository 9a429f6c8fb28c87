use crate::context;
use crate::Activity;
use futures_core::Stream;
use futures_sink::Sink;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

pin_project! {
    /// A future, stream, or sink carrying its own current activity.
    ///
    /// The wrapped activity is installed as current for the duration of
    /// every poll and captured back afterwards, so the flow's pointer
    /// survives across polls (and across the threads an executor may move
    /// the task between) while the polling thread's own pointer is always
    /// restored. Wrapping snapshots the activity at the point of the
    /// fork; branches diverge independently thereafter.
    #[derive(Clone, Debug)]
    pub struct WithActivity<T> {
        #[pin]
        inner: T,
        activity: Option<Activity>,
    }
}

/// Restores the polling thread's activity and captures the flow's pointer
/// back into the wrapper, including when the inner poll panics.
struct RestoreOnDrop<'a> {
    previous: Option<Option<Activity>>,
    slot: &'a mut Option<Activity>,
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.slot = context::swap(previous);
        }
    }
}

impl<T: std::future::Future> std::future::Future for WithActivity<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _restore = RestoreOnDrop {
            previous: Some(context::swap(this.activity.clone())),
            slot: this.activity,
        };
        this.inner.poll(task_cx)
    }
}

impl<T: Stream> Stream for WithActivity<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _restore = RestoreOnDrop {
            previous: Some(context::swap(this.activity.clone())),
            slot: this.activity,
        };
        T::poll_next(this.inner, task_cx)
    }
}

impl<I, T: Sink<I>> Sink<I> for WithActivity<T> {
    type Error = T::Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _restore = RestoreOnDrop {
            previous: Some(context::swap(this.activity.clone())),
            slot: this.activity,
        };
        T::poll_ready(this.inner, task_cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        let this = self.project();
        let _restore = RestoreOnDrop {
            previous: Some(context::swap(this.activity.clone())),
            slot: this.activity,
        };
        T::start_send(this.inner, item)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _restore = RestoreOnDrop {
            previous: Some(context::swap(this.activity.clone())),
            slot: this.activity,
        };
        T::poll_flush(this.inner, task_cx)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _restore = RestoreOnDrop {
            previous: Some(context::swap(this.activity.clone())),
            slot: this.activity,
        };
        T::poll_close(this.inner, task_cx)
    }
}

// The following three extension traits are _almost_ identical, but need to
// be separate to avoid overlapping implementation errors.

impl<F: std::future::Future> FutureActivityExt for F {}

/// Extension trait carrying an activity across a future's polls.
pub trait FutureActivityExt: Sized {
    /// Attaches the given activity to this future; it will be current
    /// while the future is being polled.
    fn with_activity(self, activity: Option<Activity>) -> WithActivity<Self> {
        WithActivity {
            inner: self,
            activity,
        }
    }

    /// Attaches a snapshot of the caller's current activity to this
    /// future.
    fn with_current_activity(self) -> WithActivity<Self> {
        let activity = context::current();
        self.with_activity(activity)
    }
}

impl<S: Stream> StreamActivityExt for S {}

/// Extension trait carrying an activity across a stream's polls.
pub trait StreamActivityExt: Sized {
    /// Attaches the given activity to this stream; it will be current
    /// while the stream is being polled.
    fn with_activity(self, activity: Option<Activity>) -> WithActivity<Self> {
        WithActivity {
            inner: self,
            activity,
        }
    }

    /// Attaches a snapshot of the caller's current activity to this
    /// stream.
    fn with_current_activity(self) -> WithActivity<Self> {
        let activity = context::current();
        self.with_activity(activity)
    }
}

impl<_I, S: Sink<_I>> SinkActivityExt<_I> for S {}

/// Extension trait carrying an activity across a sink's polls.
///
/// The generic argument is unused.
pub trait SinkActivityExt<_I>: Sized {
    /// Attaches the given activity to this sink; it will be current while
    /// the sink is being polled.
    fn with_activity(self, activity: Option<Activity>) -> WithActivity<Self> {
        WithActivity {
            inner: self,
            activity,
        }
    }

    /// Attaches a snapshot of the caller's current activity to this sink.
    fn with_current_activity(self) -> WithActivity<Self> {
        let activity = context::current();
        self.with_activity(activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    #[test]
    fn attached_activity_is_current_during_poll() {
        let activity = Activity::new("request");
        activity.start();
        context::set_current(None);

        let seen = futures_executor::block_on(
            async { context::current().map(|current| current.operation_name().to_owned()) }
                .with_activity(Some(activity.clone())),
        );
        assert_eq!(seen.as_deref(), Some("request"));

        // The polling thread's own pointer is untouched.
        assert!(context::current().is_none());
        activity.stop();
    }

    #[test]
    fn with_current_activity_snapshots_the_caller() {
        let activity = Activity::new("request");
        activity.start();

        let fut = async { context::current().map(|current| current.operation_name().to_owned()) }
            .with_current_activity();

        // Diverge the caller's flow after the fork; the snapshot is kept.
        context::set_current(None);
        let seen = futures_executor::block_on(fut);
        assert_eq!(seen.as_deref(), Some("request"));
        activity.stop();
    }

    /// Starts an activity on its first poll and reads the ambient pointer
    /// on its second, exercising flow continuity across polls.
    struct TwoStep {
        step: u8,
    }

    impl Future for TwoStep {
        type Output = Option<String>;

        fn poll(mut self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
            if self.step == 0 {
                self.step = 1;
                Activity::new("started-inside").start();
                task_cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Poll::Ready(context::current().map(|current| current.operation_name().to_owned()))
        }
    }

    #[test]
    fn pointer_flows_forward_between_polls() {
        context::set_current(None);
        let seen = futures_executor::block_on(TwoStep { step: 0 }.with_activity(None));
        assert_eq!(seen.as_deref(), Some("started-inside"));
        // The activity started inside the flow never leaks out of it.
        assert!(context::current().is_none());
    }
}
