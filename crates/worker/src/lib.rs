//! Background delivery worker: the `email` and `push` channels.

pub mod channels;
