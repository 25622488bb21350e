//! Background tasks of the control connection.

pub(crate) mod receive;
pub(crate) mod renew;
