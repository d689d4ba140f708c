pub(crate) mod http;
pub mod test_support;
