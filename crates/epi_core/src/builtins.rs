//! Built-in function registry used by the expression VM.
//!
//! The registry is built once per process and never mutated afterwards.
//! Sampling functions draw from the random source handed to the VM, so a
//! seeded generator makes a whole simulation reproducible.

use crate::equation_engine::EvalError;
use rand::{Rng, RngCore};
use rand_distr::{
    Beta, Binomial, ChiSquared, Distribution, Exp, Gamma, Hypergeometric, Normal, Poisson, StudentT,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

pub type BuiltinFn = fn(&[f64], &mut dyn RngCore) -> Result<f64, EvalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

pub struct Builtin {
    pub name: &'static str,
    pub arity: Arity,
    pub eval: BuiltinFn,
}

pub struct Registry {
    functions: Vec<Builtin>,
    index: HashMap<&'static str, usize>,
}

impl Registry {
    fn new(functions: Vec<Builtin>) -> Self {
        let index = functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name, i))
            .collect();
        Self { functions, index }
    }

    pub fn lookup(&self, name: &str) -> Option<(usize, &Builtin)> {
        self.index
            .get(name)
            .map(|&id| (id, &self.functions[id]))
    }

    pub fn get(&self, id: usize) -> Option<&Builtin> {
        self.functions.get(id)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.functions.iter().map(|f| f.name)
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry::new(default_builtins()))
}

macro_rules! unary {
    ($name:literal, $f:expr) => {
        Builtin {
            name: $name,
            arity: Arity::Exact(1),
            eval: |args, _| Ok(($f)(args[0])),
        }
    };
}

macro_rules! binary {
    ($name:literal, $f:expr) => {
        Builtin {
            name: $name,
            arity: Arity::Exact(2),
            eval: |args, _| Ok(($f)(args[0], args[1])),
        }
    };
}

fn default_builtins() -> Vec<Builtin> {
    vec![
        unary!("sin", f64::sin),
        unary!("cos", f64::cos),
        unary!("tan", f64::tan),
        unary!("asin", f64::asin),
        unary!("acos", f64::acos),
        unary!("atan", f64::atan),
        binary!("atan2", f64::atan2),
        unary!("sinh", f64::sinh),
        unary!("cosh", f64::cosh),
        unary!("tanh", f64::tanh),
        unary!("asinh", f64::asinh),
        unary!("acosh", f64::acosh),
        unary!("atanh", f64::atanh),
        unary!("log", f64::log10),
        unary!("ln", f64::ln),
        unary!("exp", f64::exp),
        binary!("pow", f64::powf),
        unary!("sqrt", f64::sqrt),
        unary!("abs", f64::abs),
        binary!("mod", |a: f64, b: f64| a % b),
        unary!("round", f64::round),
        unary!("floor", f64::floor),
        unary!("ceil", f64::ceil),
        Builtin {
            name: "sum",
            arity: Arity::AtLeast(1),
            eval: |args, _| Ok(args.iter().sum()),
        },
        Builtin {
            name: "rand",
            arity: Arity::Exact(0),
            eval: |_, rng| Ok(rng.gen::<f64>()),
        },
        Builtin {
            name: "binomial",
            arity: Arity::Exact(2),
            eval: sample_binomial,
        },
        Builtin {
            name: "negbinomial",
            arity: Arity::Exact(2),
            eval: sample_negative_binomial,
        },
        Builtin {
            name: "hypergeometric",
            arity: Arity::Exact(3),
            eval: sample_hypergeometric,
        },
        Builtin {
            name: "poisson",
            arity: Arity::Exact(1),
            eval: sample_poisson,
        },
        Builtin {
            name: "beta",
            arity: Arity::Exact(2),
            eval: sample_beta,
        },
        Builtin {
            name: "chisquare",
            arity: Arity::Exact(1),
            eval: sample_chi_square,
        },
        Builtin {
            name: "exponential",
            arity: Arity::Exact(1),
            eval: sample_exponential,
        },
        Builtin {
            name: "gamma",
            arity: Arity::Exact(2),
            eval: sample_gamma,
        },
        Builtin {
            name: "normal",
            arity: Arity::Exact(2),
            eval: sample_normal,
        },
        Builtin {
            name: "studentt",
            arity: Arity::Exact(1),
            eval: sample_student_t,
        },
        Builtin {
            name: "uniform",
            arity: Arity::Exact(2),
            eval: sample_uniform,
        },
    ]
}

fn domain(function: &'static str, message: impl Into<String>) -> EvalError {
    EvalError::Domain {
        function,
        message: message.into(),
    }
}

fn count(function: &'static str, what: &str, value: f64) -> Result<u64, EvalError> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Ok(value as u64)
    } else {
        Err(domain(
            function,
            format!("{what} must be a non-negative integer, got {value}"),
        ))
    }
}

fn positive(function: &'static str, what: &str, value: f64) -> Result<f64, EvalError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(domain(function, format!("{what} must be positive, got {value}")))
    }
}

fn probability(function: &'static str, value: f64) -> Result<f64, EvalError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(domain(
            function,
            format!("probability must lie in [0, 1], got {value}"),
        ))
    }
}

fn sample_binomial(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let n = count("binomial", "trials", args[0])?;
    let p = probability("binomial", args[1])?;
    let dist = Binomial::new(n, p).map_err(|e| domain("binomial", e.to_string()))?;
    Ok(dist.sample(rng) as f64)
}

/// Gamma–Poisson mixture: the number of failures before `r` successes.
fn sample_negative_binomial(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let r = positive("negbinomial", "successes", args[0])?;
    let p = probability("negbinomial", args[1])?;
    if p == 0.0 {
        return Err(domain("negbinomial", "probability must be greater than 0"));
    }
    if p == 1.0 {
        return Ok(0.0);
    }
    let gamma = Gamma::new(r, (1.0 - p) / p).map_err(|e| domain("negbinomial", e.to_string()))?;
    let lambda: f64 = gamma.sample(rng);
    if lambda <= 0.0 {
        return Ok(0.0);
    }
    let poisson = Poisson::new(lambda).map_err(|e| domain("negbinomial", e.to_string()))?;
    Ok(poisson.sample(rng))
}

fn sample_hypergeometric(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let total = count("hypergeometric", "population size", args[0])?;
    let successes = count("hypergeometric", "success count", args[1])?;
    let draws = count("hypergeometric", "draw count", args[2])?;
    if successes > total || draws > total {
        return Err(domain(
            "hypergeometric",
            format!("success count and draws must not exceed population size {total}"),
        ));
    }
    let dist = Hypergeometric::new(total, successes, draws)
        .map_err(|e| domain("hypergeometric", e.to_string()))?;
    Ok(dist.sample(rng) as f64)
}

fn sample_poisson(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let lambda = positive("poisson", "mean", args[0])?;
    let dist = Poisson::new(lambda).map_err(|e| domain("poisson", e.to_string()))?;
    Ok(dist.sample(rng))
}

fn sample_beta(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let alpha = positive("beta", "alpha", args[0])?;
    let beta = positive("beta", "beta", args[1])?;
    let dist = Beta::new(alpha, beta).map_err(|e| domain("beta", e.to_string()))?;
    Ok(dist.sample(rng))
}

fn sample_chi_square(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let k = positive("chisquare", "degrees of freedom", args[0])?;
    let dist = ChiSquared::new(k).map_err(|e| domain("chisquare", e.to_string()))?;
    Ok(dist.sample(rng))
}

fn sample_exponential(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let lambda = positive("exponential", "rate", args[0])?;
    let dist = Exp::new(lambda).map_err(|e| domain("exponential", e.to_string()))?;
    Ok(dist.sample(rng))
}

fn sample_gamma(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let shape = positive("gamma", "shape", args[0])?;
    let scale = positive("gamma", "scale", args[1])?;
    let dist = Gamma::new(shape, scale).map_err(|e| domain("gamma", e.to_string()))?;
    Ok(dist.sample(rng))
}

fn sample_normal(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let mean = args[0];
    let sd = args[1];
    if !mean.is_finite() || !sd.is_finite() || sd < 0.0 {
        return Err(domain(
            "normal",
            format!("mean must be finite and standard deviation non-negative, got ({mean}, {sd})"),
        ));
    }
    let dist = Normal::new(mean, sd).map_err(|e| domain("normal", e.to_string()))?;
    Ok(dist.sample(rng))
}

fn sample_student_t(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let dof = positive("studentt", "degrees of freedom", args[0])?;
    let dist = StudentT::new(dof).map_err(|e| domain("studentt", e.to_string()))?;
    Ok(dist.sample(rng))
}

fn sample_uniform(args: &[f64], rng: &mut dyn RngCore) -> Result<f64, EvalError> {
    let (low, high) = (args[0], args[1]);
    if !low.is_finite() || !high.is_finite() || low > high {
        return Err(domain(
            "uniform",
            format!("bounds must be finite with low <= high, got ({low}, {high})"),
        ));
    }
    if low == high {
        return Ok(low);
    }
    Ok(rng.gen_range(low..high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn call(name: &str, args: &[f64]) -> Result<f64, EvalError> {
        let (_, builtin) = registry().lookup(name).expect("builtin should exist");
        let mut rng = StdRng::seed_from_u64(42);
        (builtin.eval)(args, &mut rng)
    }

    #[test]
    fn registry_contains_all_samplers() {
        for name in [
            "binomial",
            "negbinomial",
            "hypergeometric",
            "poisson",
            "beta",
            "chisquare",
            "exponential",
            "gamma",
            "normal",
            "studentt",
            "uniform",
            "rand",
        ] {
            assert!(registry().lookup(name).is_some(), "missing {name}");
        }
        assert!(registry().names().count() >= 36);
    }

    #[test]
    fn math_functions_match_std() {
        assert!((call("log", &[1000.0]).unwrap() - 3.0).abs() < 1e-12);
        assert_eq!(call("ln", &[1.0]).unwrap(), 0.0);
        assert_eq!(call("mod", &[7.0, 3.0]).unwrap(), 1.0);
        assert_eq!(call("round", &[2.5]).unwrap(), 3.0);
        assert_eq!(call("sum", &[1.0, 2.0, 3.5]).unwrap(), 6.5);
        assert_eq!(call("pow", &[2.0, 10.0]).unwrap(), 1024.0);
    }

    #[test]
    fn samplers_reject_out_of_domain_parameters() {
        assert!(matches!(
            call("binomial", &[10.0, 1.5]),
            Err(EvalError::Domain { function: "binomial", .. })
        ));
        assert!(call("binomial", &[2.5, 0.5]).is_err());
        assert!(call("poisson", &[-1.0]).is_err());
        assert!(call("hypergeometric", &[5.0, 6.0, 2.0]).is_err());
        assert!(call("normal", &[0.0, -1.0]).is_err());
        assert!(call("uniform", &[2.0, 1.0]).is_err());
        assert!(call("gamma", &[0.0, 1.0]).is_err());
        assert!(call("negbinomial", &[3.0, 0.0]).is_err());
    }

    #[test]
    fn samplers_stay_within_support() {
        let mut rng = StdRng::seed_from_u64(1);
        let (_, binomial) = registry().lookup("binomial").unwrap();
        let (_, uniform) = registry().lookup("uniform").unwrap();
        let (_, hyper) = registry().lookup("hypergeometric").unwrap();
        for _ in 0..200 {
            let b = (binomial.eval)(&[20.0, 0.3], &mut rng).unwrap();
            assert!((0.0..=20.0).contains(&b) && b.fract() == 0.0);
            let u = (uniform.eval)(&[-1.0, 1.0], &mut rng).unwrap();
            assert!((-1.0..1.0).contains(&u));
            let h = (hyper.eval)(&[50.0, 10.0, 5.0], &mut rng).unwrap();
            assert!((0.0..=5.0).contains(&h));
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let first = call("normal", &[10.0, 2.0]).unwrap();
        let second = call("normal", &[10.0, 2.0]).unwrap();
        assert_eq!(first, second);
    }
}
