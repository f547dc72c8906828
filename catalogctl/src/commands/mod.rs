pub(crate) mod check;
pub(crate) mod classify;
pub(crate) mod fetch;
pub(crate) mod history;
pub(crate) mod prune;
