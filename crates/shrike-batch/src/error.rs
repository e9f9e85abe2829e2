#[non_exhaustive]
#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "invalid batch option {}: {}", name, value)]
    InvalidOption { name: &'static str, value: i64 },
}

impl error_stack::Context for Error {}
