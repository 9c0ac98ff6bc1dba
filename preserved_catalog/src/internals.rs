pub(crate) mod serialize;
