use std::fmt;

/// Aggregate of independent failures; keeps every cause instead of only the first.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, err: impl Into<anyhow::Error>) { self.errors.push(err.into()); }

    pub fn is_empty(&self) -> bool { self.errors.is_empty() }
    pub fn len(&self) -> usize { self.errors.len() }
    pub fn errors(&self) -> &[anyhow::Error] { &self.errors }

    /// `Ok(())` when nothing was collected, the aggregate otherwise.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no errors"),
            [only] => write!(f, "{:#}", only),
            many => {
                write!(f, "{} errors occurred:", many.len())?;
                for e in many {
                    write!(f, "\n\t* {:#}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl FromIterator<anyhow::Error> for MultiError {
    fn from_iter<I: IntoIterator<Item = anyhow::Error>>(iter: I) -> Self {
        Self { errors: iter.into_iter().collect() }
    }
}
