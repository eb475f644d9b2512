use std::path::Path;

/// The [`KernelSource`] is a struct containing the source code of a compute program
///
/// This struct is not able to read or check the kernel code, it's only purpose is to
/// hold the content of it, eventually manipulate it, and feeding it to
/// [`crate::session::Session::create_program`].
///
/// All the code checking is done when the program is built by the native backend, once per
/// device, and never through this stage of the program.
/// This allows to write templated code and to size it at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    content: String,
}

impl KernelSource {
    /// This method creates a kernel source from a string literal.
    ///
    /// No effort whatsoever is done at this stage to check the correctness of the code.
    ///
    /// # Example
    /// ```
    /// use multicl::source::KernelSource;
    /// // This kernel squares its input
    /// let source = KernelSource::from_content("
    ///     @group(0) @binding(0)
    ///     var<storage, read> input: array<i32>;
    ///     @group(0) @binding(1)
    ///     var<storage, read_write> output: array<i32>;
    ///
    ///     @compute @workgroup_size(1)
    ///     fn square(@builtin(global_invocation_id) id: vec3<u32>) {
    ///         output[id.x] = input[id.x] * input[id.x];
    ///     }
    /// ");
    /// assert!(!source.is_empty());
    /// ```
    pub fn from_content(content: &str) -> Self {
        KernelSource {
            content: content.to_string(),
        }
    }

    /// This functions reads a kernel file to the source content.
    ///
    /// It will open the file and simply put the content into the struct as a [`String`].
    ///
    /// # Errors
    /// - if the file doesn't exist or is not readable
    pub fn from_file_path(path_to_module: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path_to_module)?;
        Ok(KernelSource { content })
    }

    /// This function replaces the `from` string with the `to` string inside the [`KernelSource`]
    ///
    /// It replaces all the instances of the `from` string, so use this with caution, since no check on
    /// correctness of the final code is done in this function.
    /// It's useful to create tokens inside a file which are not valid code, but will become once tokens are replaced,
    /// for instance to size an array to an input only known at run time.
    ///
    /// # Examples
    /// ```
    /// use multicl::source::KernelSource;
    /// let mut source = KernelSource::from_content("var<private> data: array<f32, €len>;");
    /// source.replace("€len", 16.to_string().as_str());
    /// assert_eq!(source.get_content(), "var<private> data: array<f32, 16>;");
    /// ```
    pub fn replace(&mut self, from: &str, to: &str) {
        self.content = self.content.replace(from, to);
    }

    /// This methods gets the content of the [`KernelSource`] as a string reference
    pub fn get_content(&self) -> &str {
        &self.content
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

impl From<&str> for KernelSource {
    fn from(content: &str) -> Self {
        KernelSource::from_content(content)
    }
}

impl From<String> for KernelSource {
    fn from(content: String) -> Self {
        KernelSource { content }
    }
}
