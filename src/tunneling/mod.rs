pub(crate) mod check;
pub(crate) mod command;
pub(crate) mod group;
pub(crate) mod supervisor;
pub(crate) mod tunnel;
