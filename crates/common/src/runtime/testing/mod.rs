mod future_set;
mod handle;
mod runtime;
mod timer;

pub use self::{
    handle::TestFutureHandle,
    runtime::{
        TestDriver,
        TestRuntime,
    },
};
