use std::error::Error;

pub enum ExitResult<T> {
    Ok(T),
    Err(Box<dyn Error>, i32),
}

impl<T> ExitResult<T> {
    pub fn err_from<E: Error + 'static>(e: E, code: i32) -> ExitResult<T> {
        ExitResult::Err(Box::new(e), code)
    }

    /// Prints the error, if any, and returns the process exit status.
    pub fn report(self) -> i32 {
        match self {
            ExitResult::Ok(_) => 0,
            ExitResult::Err(b, c) => {
                eprintln!("Error: {}", b);
                c
            }
        }
    }
}
