mod disposal;
mod task;


pub(crate) use disposal::DisposalGate;
pub(crate) use task::join_with_timeout;
pub(crate) use task::spawn_named;
