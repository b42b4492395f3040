// Copyright (c) Microsoft Corporation.

//! The thread-keyed registry mode, isolated in its own binary because the
//! switch is process-wide.

use mulligan::support::{current_context, set_use_thread_local};
use mulligan::Retry;

#[derive(Debug, thiserror::Error)]
#[error("boom")]
struct Boom;

#[test]
fn thread_map_mode_publishes_and_clears_the_context() {
    set_use_thread_local(false);

    let retry = Retry::<Boom>::builder().build();

    retry
        .execute(|ctx| {
            let current = current_context::<Boom>().expect("context registered in map mode");
            assert!(std::ptr::eq(&*current, ctx));
            Ok::<_, Boom>(())
        })
        .unwrap();

    assert!(current_context::<Boom>().is_none());
}
