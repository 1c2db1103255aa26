pub mod addr;
pub mod config;
pub mod net;
pub mod packet;
pub mod resend;
pub mod test_util;
pub mod transport;
pub mod util;
