use std::fmt;

/// An authenticated user, as produced by the server's credential validator.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct User {
    name: String,
}

impl User {
    pub fn new<S: Into<String>>(name: S) -> User {
        User { name: name.into() }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
