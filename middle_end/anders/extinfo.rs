//! Effect classes for external (library) functions.
//!
//! Assume a call in the form `L = F(arg0, arg1, arg2, arg3)`.  Each known
//! function name maps to a tag describing its effect on the known
//! pointers; unknown names get `Other`, which is treated as a no-op with
//! a diagnostic.

use std::collections::BTreeMap as Map;

use crate::middle_end::lir::{FuncId, Program};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtEffect {
    /// No effect on pointers.
    Noop,
    /// L points to a newly allocated object.
    Alloc,
    /// Like `Alloc` if arg0 is a null pointer, else returns arg0.
    Realloc,
    /// Like `Alloc` but only allocates non-struct data.
    NostructAlloc,
    /// L points to an unknown static object X.
    Stat,
    /// L -> X and X -> Y (a second static object).
    Stat2,
    /// Returns arg `n`.
    LArg(u8),
    /// Copies the data `src` points to into the location `dst` points to;
    /// several fields may be copied at once if both point to structs,
    /// unless `ns` (no-struct) is set.  With `ret`, also returns `dst`.
    CopyR { dst: u8, src: u8, ns: bool, ret: bool },
    /// Stores arg `src` into `*arg dst`; with `ret`, also returns it.
    StoreArg { dst: u8, src: u8, ret: bool },
    /// Stores a pointer to a newly allocated object into `*arg n`.
    NewArg(u8),
    /// Not found in the table.
    Other,
}

use ExtEffect::*;

// The name table.  This covers the common libc/POSIX shapes; names not
// listed default to Other.
#[rustfmt::skip]
static EXT_TABLE: &[(&str, ExtEffect)] = &[
    // allocators
    ("malloc", Alloc),
    ("calloc", Alloc),
    ("valloc", Alloc),
    ("memalign", Alloc),
    ("strdup", NostructAlloc),
    ("strndup", NostructAlloc),
    ("getcwd", NostructAlloc),
    ("tmpfile", Alloc),
    ("fopen", Alloc),
    ("fdopen", Alloc),
    ("popen", Alloc),
    ("opendir", Alloc),
    ("setlocale", NostructAlloc),
    ("realloc", Realloc),
    // statically allocated returns
    ("getenv", Stat),
    ("strerror", Stat),
    ("gmtime", Stat),
    ("localtime", Stat),
    ("ttyname", Stat),
    ("getpwuid", Stat2),
    ("getpwnam", Stat2),
    ("getgrgid", Stat2),
    ("getgrnam", Stat2),
    ("readdir", Stat2),
    ("gettext", LArg(0)),
    // identity-returning
    ("fgets", LArg(0)),
    ("gets", LArg(0)),
    ("stpcpy", LArg(0)),
    ("strcat", LArg(0)),
    ("strchr", LArg(0)),
    ("strcpy", LArg(0)),
    ("strncat", LArg(0)),
    ("strncpy", LArg(0)),
    ("strpbrk", LArg(0)),
    ("strrchr", LArg(0)),
    ("strstr", LArg(0)),
    ("strtok", LArg(0)),
    ("bsearch", LArg(1)),
    ("freopen", LArg(2)),
    // memory movers: copy *arg1 into *arg0 and return arg0
    ("memcpy", CopyR { dst: 0, src: 1, ns: false, ret: true }),
    ("memmove", CopyR { dst: 0, src: 1, ns: false, ret: true }),
    ("memccpy", CopyR { dst: 0, src: 1, ns: false, ret: true }),
    ("bcopy", CopyR { dst: 1, src: 0, ns: false, ret: false }),
    ("strtod", StoreArg { dst: 1, src: 0, ret: false }),
    ("strtol", StoreArg { dst: 1, src: 0, ret: false }),
    ("strtoll", StoreArg { dst: 1, src: 0, ret: false }),
    ("strtoul", StoreArg { dst: 1, src: 0, ret: false }),
    // stores into pointed-to locations
    ("gettimeofday", NewArg(0)),
    ("asprintf", NewArg(0)),
    ("vasprintf", NewArg(0)),
    ("scandir", NewArg(1)),
    ("getaddrinfo", NewArg(3)),
    ("posix_memalign", NewArg(0)),
    ("pthread_create", StoreArg { dst: 0, src: 3, ret: false }),
    ("sigaction", CopyR { dst: 2, src: 1, ns: true, ret: false }),
    // no effect on pointers
    ("atoi", Noop),
    ("atof", Noop),
    ("atol", Noop),
    ("close", Noop),
    ("exit", Noop),
    ("abort", Noop),
    ("fclose", Noop),
    ("fflush", Noop),
    ("fprintf", Noop),
    ("fputs", Noop),
    ("fputc", Noop),
    ("fread", Noop),
    ("free", Noop),
    ("fseek", Noop),
    ("ftell", Noop),
    ("fwrite", Noop),
    ("memcmp", Noop),
    ("memset", LArg(0)),
    ("printf", Noop),
    ("puts", Noop),
    ("putchar", Noop),
    ("qsort", Noop),
    ("rand", Noop),
    ("random", Noop),
    ("read", Noop),
    ("remove", Noop),
    ("rename", Noop),
    ("rewind", Noop),
    ("scanf", Noop),
    ("sscanf", Noop),
    ("fscanf", Noop),
    ("snprintf", Noop),
    ("sprintf", Noop),
    ("srand", Noop),
    ("strcmp", Noop),
    ("strcasecmp", Noop),
    ("strncasecmp", Noop),
    ("strlen", Noop),
    ("strncmp", Noop),
    ("system", Noop),
    ("time", Noop),
    ("unlink", Noop),
    ("write", Noop),
    ("llvm.memcpy", CopyR { dst: 0, src: 1, ns: false, ret: false }),
    ("llvm.memmove", CopyR { dst: 0, src: 1, ns: false, ret: false }),
    ("llvm.memset", Noop),
    ("llvm.va_start", Noop),
    ("llvm.va_end", Noop),
];

/// Provides access to info about external functions, memoizing lookups by
/// function identity.
#[derive(Debug)]
pub struct ExtInfo {
    info: Map<&'static str, ExtEffect>,
    isext_cache: Map<FuncId, bool>,
}

impl Default for ExtInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtInfo {
    pub fn new() -> Self {
        ExtInfo {
            info: EXT_TABLE.iter().copied().collect(),
            isext_cache: Map::new(),
        }
    }

    /// The effect of the function with the given name.
    pub fn get_effect(&self, name: &str) -> ExtEffect {
        self.info.get(name).copied().unwrap_or(Other)
    }

    /// Is the name known to the table at all?
    pub fn is_known(&self, name: &str) -> bool {
        self.info.contains_key(name)
    }

    /// Does the function have a static object X (unavailable to us) that
    /// its return points to?
    pub fn has_static(&self, name: &str) -> bool {
        matches!(self.get_effect(name), Stat | Stat2)
    }

    pub fn is_alloc(&self, name: &str) -> bool {
        matches!(self.get_effect(name), Alloc | NostructAlloc)
    }

    pub fn no_struct_alloc(&self, name: &str) -> bool {
        self.get_effect(name) == NostructAlloc
    }

    pub fn is_noop(&self, name: &str) -> bool {
        self.get_effect(name) == Noop
    }

    /// Should the function be considered external: either not defined in
    /// the program, or a user-defined version of a known allocator or
    /// no-op?  Memoized by function identity.
    pub fn is_ext(&mut self, f: &FuncId, prog: &Program) -> bool {
        if let Some(&res) = self.isext_cache.get(f) {
            return res;
        }
        let res = if !prog.functions.contains_key(f) {
            true
        } else {
            matches!(
                self.get_effect(&f.0),
                Alloc | Realloc | NostructAlloc | Noop
            )
        };
        self.isext_cache.insert(f.clone(), res);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_are_other() {
        let info = ExtInfo::new();
        assert_eq!(info.get_effect("frobnicate"), Other);
        assert!(!info.is_known("frobnicate"));
    }

    #[test]
    fn known_shapes() {
        let info = ExtInfo::new();
        assert_eq!(info.get_effect("malloc"), Alloc);
        assert_eq!(info.get_effect("realloc"), Realloc);
        assert_eq!(info.get_effect("strcpy"), LArg(0));
        assert!(info.has_static("getenv"));
        assert!(info.has_static("getpwuid"));
        assert!(info.is_noop("free"));
        assert_eq!(
            info.get_effect("memcpy"),
            CopyR { dst: 0, src: 1, ns: false, ret: true }
        );
    }
}
