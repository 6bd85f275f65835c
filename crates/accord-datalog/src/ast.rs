//! Abstract syntax of the rule language.
//!
//! ```text
//! port_sg(id, sg) :- neutronv2:ports(id, _), neutronv2:sg_bindings(id, sg)
//! execute[nova:servers_set_meta(id, "k", "v")] :- test_servers(id)
//! res(x) :- comp:path(y, z), builtin:concat(y, " - ", t), builtin:concat(t, z, x)
//! link(1, 2)
//! ```

use std::fmt;

use crate::value::Value;

/// Owner qualifier used for builtin invocations (`builtin:plus(x, y, z)`).
pub const BUILTIN_OWNER: &str = "builtin";

/// A term inside a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// A named variable (any bare identifier).
    Var(String),
    /// A string, integer or `None` constant.
    Const(Value),
    /// The anonymous variable `_`.
    Wildcard,
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(name) => write!(f, "{}", name),
            Term::Const(Value::Str(s)) => write!(f, "{:?}", s),
            Term::Const(v) => write!(f, "{}", v),
            Term::Wildcard => write!(f, "_"),
        }
    }
}

/// A possibly-qualified predicate reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    /// Datasource or policy name; `None` for the owning policy.
    pub owner: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            owner: None,
            name: name.into(),
        }
    }

    pub fn qualified(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{}:{}", owner, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A predicate applied to terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom {
    pub table: TableRef,
    pub args: Vec<Term>,
    /// `column=term` arguments, resolved against the table schema.
    pub named: Vec<(String, Term)>,
}

impl Atom {
    pub fn new(table: TableRef, args: Vec<Term>) -> Self {
        Self {
            table,
            args,
            named: Vec::new(),
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.table)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        for (i, (column, arg)) in self.named.iter().enumerate() {
            if i > 0 || !self.args.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", column, arg)?;
        }
        write!(f, ")")
    }
}

/// A body literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    pub atom: Atom,
    pub negated: bool,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "not ")?;
        }
        write!(f, "{}", self.atom)
    }
}

/// A rule head.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Head {
    /// Derives rows into a table of the owning policy.
    Atom(Atom),
    /// Derives execution facts for `service:action`.
    Execute {
        service: String,
        action: String,
        args: Vec<Term>,
    },
}

impl Head {
    /// Name of the derived table this head writes to.
    pub fn table_name(&self) -> String {
        match self {
            Head::Atom(atom) => atom.table.name.clone(),
            Head::Execute {
                service, action, ..
            } => execution_table(service, action),
        }
    }

    pub fn args(&self) -> &[Term] {
        match self {
            Head::Atom(atom) => &atom.args,
            Head::Execute { args, .. } => args,
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Head::Atom(atom) => write!(f, "{}", atom),
            Head::Execute {
                service,
                action,
                args,
            } => {
                let atom = Atom::new(
                    TableRef::qualified(service.clone(), action.clone()),
                    args.clone(),
                );
                write!(f, "execute[{}]", atom)
            }
        }
    }
}

/// Name of the derived table holding execution facts for `service:action`.
pub fn execution_table(service: &str, action: &str) -> String {
    format!("execute[{}:{}]", service, action)
}

/// Split an execution table name back into `(service, action)`.
pub fn parse_execution_table(table: &str) -> Option<(&str, &str)> {
    let inner = table.strip_prefix("execute[")?.strip_suffix(']')?;
    inner.split_once(':')
}

/// A parsed rule. Facts are rules with an empty body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub head: Head,
    pub body: Vec<Literal>,
}

impl Rule {
    pub fn is_fact(&self) -> bool {
        self.body.is_empty()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.head)?;
        if !self.body.is_empty() {
            write!(f, " :- ")?;
            for (i, lit) in self.body.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", lit)?;
            }
        }
        Ok(())
    }
}
