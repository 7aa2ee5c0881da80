//! Selective include loading.
//!
//! The engine declarations are always visible. Any other `#include` is loaded
//! as a whole file only when at least one name it declares is used somewhere
//! in the unit; includes of loaded libraries become candidates in turn, and
//! evaluation repeats until nothing new loads.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use super::ast::*;
use super::error::CompileError;
use super::parser::parse_source;
use super::types::NssType;
use crate::paths::{collect_files, normalize_include_name, CORE_LIBRARY, SOURCE_EXT};

/// Every include a compilation may pull in, keyed by normalized name.
/// Populated before compiling so resolution itself does no I/O.
#[derive(Debug, Clone, Default)]
pub struct LibraryTable {
    sources: IndexMap<String, String>,
}

impl LibraryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every `.nss` file in `dirs`. A name found in an earlier
    /// directory shadows later ones.
    pub fn from_search_paths(dirs: &[PathBuf]) -> std::io::Result<Self> {
        let mut table = Self::new();
        for dir in dirs {
            table.add_dir(dir)?;
        }
        Ok(table)
    }

    pub fn add_dir(&mut self, dir: &Path) -> std::io::Result<()> {
        if !dir.is_dir() {
            log::warn!("include directory {} does not exist", dir.display());
            return Ok(());
        }
        for path in collect_files(dir, false, SOURCE_EXT)? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let name = normalize_include_name(stem);
            if self.sources.contains_key(&name) {
                continue;
            }
            let source = std::fs::read_to_string(&path)?;
            self.sources.insert(name, source);
        }
        Ok(())
    }

    pub fn insert(&mut self, name: &str, source: impl Into<String>) {
        self.sources
            .entry(normalize_include_name(name))
            .or_insert_with(|| source.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.sources.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// One parsed source in the unit. `name` is `None` for the main file.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub name: Option<String>,
    pub script: Script,
}

/// Loaded libraries in load order, followed by the main file.
#[derive(Debug, Clone)]
pub struct ResolvedUnit {
    pub units: Vec<SourceUnit>,
}

impl ResolvedUnit {
    pub fn loaded_libraries(&self) -> Vec<&str> {
        self.units.iter().filter_map(|u| u.name.as_deref()).collect()
    }
}

pub fn resolve(main: Script, libraries: &LibraryTable) -> Result<ResolvedUnit, CompileError> {
    let mut used: HashSet<String> = HashSet::new();
    collect_used_names(&main, &mut used);

    let mut candidates: Vec<String> = main.includes.iter().map(|i| i.name.clone()).collect();
    let mut parsed: IndexMap<String, Script> = IndexMap::new();
    let mut loaded: Vec<String> = Vec::new();
    let mut skipped: HashSet<String> = HashSet::new();

    loop {
        let mut changed = false;
        let mut i = 0;
        while i < candidates.len() {
            let name = candidates[i].clone();
            i += 1;
            if name == CORE_LIBRARY || loaded.contains(&name) || skipped.contains(&name) {
                continue;
            }
            let Some(source) = libraries.get(&name) else {
                log::debug!("include '{name}' is not in the library table; skipped");
                skipped.insert(name);
                continue;
            };
            if !parsed.contains_key(&name) {
                let script = parse_source(source).map_err(|errs| {
                    let first = errs.into_iter().next().unwrap_or_else(|| {
                        CompileError::parser("unreadable include", Span::default())
                    });
                    first.in_file(&name)
                })?;
                parsed.insert(name.clone(), script);
            }
            let Some(script) = parsed.get(&name) else { continue };
            let declared = declared_names(script);
            if let Some(hit) = declared.iter().find(|n| used.contains(*n)) {
                log::debug!("loading include '{name}' (uses '{hit}')");
                collect_used_names(script, &mut used);
                for inc in &script.includes {
                    if !candidates.contains(&inc.name) {
                        candidates.push(inc.name.clone());
                    }
                }
                loaded.push(name);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for name in candidates.iter().filter(|n| parsed.contains_key(*n) && !loaded.contains(n)) {
        log::debug!("include '{name}' declares nothing the unit uses; not loaded");
    }

    let mut units: Vec<SourceUnit> = loaded
        .into_iter()
        .filter_map(|name| {
            parsed.swap_remove(&name).map(|script| SourceUnit {
                name: Some(name),
                script,
            })
        })
        .collect();
    units.push(SourceUnit {
        name: None,
        script: main,
    });
    Ok(ResolvedUnit { units })
}

/// Names a library makes available: functions, globals and structs.
pub fn declared_names(script: &Script) -> Vec<String> {
    let mut names = Vec::new();
    for item in &script.items {
        match item {
            Item::Struct(s) => names.push(s.name.clone()),
            Item::Function(f) => names.push(f.name.clone()),
            Item::Global(g) => names.extend(g.declarators.iter().map(|d| d.name.clone())),
        }
    }
    names
}

/// Every identifier, called name and struct type mentioned by `script`.
pub fn collect_used_names(script: &Script, out: &mut HashSet<String>) {
    for item in &script.items {
        match item {
            Item::Struct(s) => {
                for f in &s.fields {
                    type_name(&f.ty, out);
                }
            }
            Item::Function(f) => {
                type_name(&f.return_type, out);
                for p in &f.params {
                    type_name(&p.ty, out);
                    if let Some(d) = &p.default {
                        expr_names(d, out);
                    }
                }
                for stmt in f.body.iter().flatten() {
                    stmt_names(stmt, out);
                }
            }
            Item::Global(g) => decl_names(g, out),
        }
    }
}

fn type_name(ty: &NssType, out: &mut HashSet<String>) {
    if let NssType::Struct(name) = ty {
        out.insert(name.clone());
    }
}

fn decl_names(decl: &VarDecl, out: &mut HashSet<String>) {
    type_name(&decl.ty, out);
    for d in &decl.declarators {
        if let Some(init) = &d.init {
            expr_names(init, out);
        }
    }
}

fn stmt_names(stmt: &Stmt, out: &mut HashSet<String>) {
    match &stmt.kind {
        StmtKind::Block(stmts) => stmts.iter().for_each(|s| stmt_names(s, out)),
        StmtKind::Decl(d) => decl_names(d, out),
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            expr_names(cond, out);
            stmt_names(then_branch, out);
            if let Some(e) = else_branch {
                stmt_names(e, out);
            }
        }
        StmtKind::While { cond, body } | StmtKind::DoWhile { body, cond } => {
            expr_names(cond, out);
            stmt_names(body, out);
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
        } => {
            for e in [init, cond, step].into_iter().flatten() {
                expr_names(e, out);
            }
            stmt_names(body, out);
        }
        StmtKind::Switch { scrutinee, cases } => {
            expr_names(scrutinee, out);
            for case in cases {
                if let CaseLabel::Case(e) = &case.label {
                    expr_names(e, out);
                }
                case.body.iter().for_each(|s| stmt_names(s, out));
            }
        }
        StmtKind::Return(Some(e)) | StmtKind::Expr(e) => expr_names(e, out),
        StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue | StmtKind::Empty => {}
    }
}

fn expr_names(expr: &Expr, out: &mut HashSet<String>) {
    match &expr.kind {
        ExprKind::IntLit(_) | ExprKind::FloatLit(_) | ExprKind::StringLit(_) | ExprKind::ObjectLit(_) => {}
        ExprKind::Ident(name) => {
            out.insert(name.clone());
        }
        ExprKind::Call { name, args } => {
            out.insert(name.clone());
            args.iter().for_each(|a| expr_names(a, out));
        }
        ExprKind::Vector(x, y, z) => {
            expr_names(x, out);
            expr_names(y, out);
            expr_names(z, out);
        }
        ExprKind::Binary { left, right, .. } => {
            expr_names(left, out);
            expr_names(right, out);
        }
        ExprKind::Unary { operand, .. } => expr_names(operand, out),
        ExprKind::IncDec { target, .. } => expr_names(target, out),
        ExprKind::Assign { target, value, .. } => {
            expr_names(target, out);
            expr_names(value, out);
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            expr_names(cond, out);
            expr_names(then_expr, out);
            expr_names(else_expr, out);
        }
        ExprKind::Field { object, .. } => expr_names(object, out),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn resolve_src(main: &str, libs: &[(&str, &str)]) -> ResolvedUnit {
        let mut table = LibraryTable::new();
        for (name, src) in libs {
            table.insert(name, *src);
        }
        resolve(parse_source(main).unwrap(), &table).unwrap()
    }

    #[test]
    fn unused_include_not_loaded() {
        let unit = resolve_src(
            "#include \"lib_a\"\nvoid main() { int x = 1; }",
            &[("lib_a", "int Helper() { return 1; }")],
        );
        assert!(unit.loaded_libraries().is_empty());
        assert_eq!(unit.units.len(), 1);
    }

    #[test]
    fn used_include_loaded_whole() {
        let unit = resolve_src(
            "#include \"lib_a\"\nvoid main() { Helper(); }",
            &[("lib_a", "int Helper() { return 1; }\nint Unused() { return 2; }")],
        );
        assert_eq!(unit.loaded_libraries(), vec!["lib_a"]);
        assert_eq!(unit.units[0].script.items.len(), 2);
        assert!(unit.units[1].name.is_none());
    }

    #[test]
    fn transitive_include_follows_loaded_library() {
        let unit = resolve_src(
            "#include \"outer\"\nvoid main() { Outer(); }",
            &[
                ("outer", "#include \"inner\"\nint Outer() { return Inner(); }"),
                ("inner", "int Inner() { return 3; }"),
            ],
        );
        assert_eq!(unit.loaded_libraries(), vec!["outer", "inner"]);
    }

    #[test]
    fn includes_of_unloaded_library_are_ignored() {
        let unit = resolve_src(
            "#include \"outer\"\nvoid main() { Inner(); }",
            &[
                ("outer", "#include \"inner\"\nint Outer() { return 1; }"),
                ("inner", "int Inner() { return 3; }"),
            ],
        );
        assert!(unit.loaded_libraries().is_empty());
    }

    #[test]
    fn struct_use_triggers_load() {
        let unit = resolve_src(
            "#include \"shapes\"\nvoid main() { struct pt p; }",
            &[("shapes", "struct pt { float x; float y; };")],
        );
        assert_eq!(unit.loaded_libraries(), vec!["shapes"]);
    }

    #[test]
    fn missing_and_core_includes_skipped() {
        let unit = resolve_src("#include \"nwscript\"\n#include \"nope\"\nvoid main() {}", &[]);
        assert_eq!(unit.units.len(), 1);
    }

    #[test]
    fn broken_library_reports_its_name() {
        let mut table = LibraryTable::new();
        table.insert("bad", "int (");
        let err = resolve(
            parse_source("#include \"bad\"\nvoid main() {}").unwrap(),
            &table,
        )
        .unwrap_err();
        assert_eq!(err.file.as_deref(), Some("bad"));
    }

    #[test]
    fn search_path_first_directory_wins() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("Lib.nss"), "int A() { return 1; }").unwrap();
        std::fs::write(b.path().join("lib.nss"), "int B() { return 2; }").unwrap();
        let table =
            LibraryTable::from_search_paths(&[a.path().to_path_buf(), b.path().to_path_buf()])
                .unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get("lib").unwrap().contains("A()"));
    }
}
