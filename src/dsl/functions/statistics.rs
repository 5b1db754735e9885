//! 统计与随机函数

use rand::Rng;

use super::{int_arg, number_arg, CallArgs, FunctionRegistry};
use crate::dsl::executor::{ExecutionError, ExecutionResult};
use crate::dsl::value::Value;

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.register("mean", mean);
    registry.register("fmean", |_: &FunctionRegistry, args: CallArgs| {
        let data = numbers(&args, "fmean")?;
        require_len(&data, 1, "fmean requires at least one data point")?;
        Ok(Value::Float(data.iter().sum::<f64>() / data.len() as f64))
    });
    registry.register("geometric_mean", |_: &FunctionRegistry, args: CallArgs| {
        let data = numbers(&args, "geometric_mean")?;
        require_len(&data, 1, "geometric_mean requires a non-empty dataset")?;
        if data.iter().any(|x| *x <= 0.0) {
            return Err(ExecutionError::ValueError(
                "geometric mean requires a non-empty dataset containing positive numbers".into(),
            ));
        }
        let log_sum: f64 = data.iter().map(|x| x.ln()).sum();
        Ok(Value::Float((log_sum / data.len() as f64).exp()))
    });
    registry.register("harmonic_mean", |_: &FunctionRegistry, args: CallArgs| {
        let data = numbers(&args, "harmonic_mean")?;
        require_len(&data, 1, "harmonic_mean requires at least one data point")?;
        if data.iter().any(|x| *x < 0.0) {
            return Err(ExecutionError::ValueError(
                "harmonic mean does not support negative values".into(),
            ));
        }
        if data.iter().any(|x| *x == 0.0) {
            return Ok(Value::Integer(0));
        }
        let reciprocal_sum: f64 = data.iter().map(|x| 1.0 / x).sum();
        Ok(Value::Float(data.len() as f64 / reciprocal_sum))
    });
    registry.register("median", |_: &FunctionRegistry, args: CallArgs| {
        let data = sorted_values(&args, "median")?;
        let n = data.len();
        if n % 2 == 1 {
            return Ok(data[n / 2].clone());
        }
        let low = number_arg(&data[n / 2 - 1], "median")?;
        let high = number_arg(&data[n / 2], "median")?;
        Ok(Value::Float((low + high) / 2.0))
    });
    registry.register("median_low", |_: &FunctionRegistry, args: CallArgs| {
        let data = sorted_values(&args, "median_low")?;
        let n = data.len();
        Ok(data[if n % 2 == 1 { n / 2 } else { n / 2 - 1 }].clone())
    });
    registry.register("median_high", |_: &FunctionRegistry, args: CallArgs| {
        let data = sorted_values(&args, "median_high")?;
        Ok(data[data.len() / 2].clone())
    });
    registry.register("mode", |_: &FunctionRegistry, args: CallArgs| {
        let modes = multimode(&args)?;
        modes.into_iter().next().ok_or_else(|| {
            ExecutionError::ValueError("no mode for empty data".into())
        })
    });
    registry.register("multimode", |_: &FunctionRegistry, args: CallArgs| {
        Ok(Value::List(multimode(&args)?))
    });
    registry.register("pvariance", |_: &FunctionRegistry, args: CallArgs| {
        Ok(Value::Float(variance(&args, "pvariance", false)?))
    });
    registry.register("variance", |_: &FunctionRegistry, args: CallArgs| {
        Ok(Value::Float(variance(&args, "variance", true)?))
    });
    registry.register("pstdev", |_: &FunctionRegistry, args: CallArgs| {
        Ok(Value::Float(variance(&args, "pstdev", false)?.sqrt()))
    });
    registry.register("stdev", |_: &FunctionRegistry, args: CallArgs| {
        Ok(Value::Float(variance(&args, "stdev", true)?.sqrt()))
    });

    // ─── 随机 ───
    registry.register("random", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("random", 0, 0)?;
        Ok(Value::Float(rand::thread_rng().gen::<f64>()))
    });
    registry.register("randrange", randrange);
    registry.register("randint", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("randint", 2, 2)?;
        let low = int_arg(&args.positional[0], "randint")?;
        let high = int_arg(&args.positional[1], "randint")?;
        if low > high {
            return Err(ExecutionError::ValueError(format!(
                "empty range for randint({}, {})",
                low, high
            )));
        }
        Ok(Value::Integer(rand::thread_rng().gen_range(low..=high)))
    });
    registry.register("choice", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("choice", 1, 1)?;
        let items = args.positional[0].iterate()?;
        if items.is_empty() {
            return Err(ExecutionError::IndexError(
                "Cannot choose from an empty sequence".into(),
            ));
        }
        let index = rand::thread_rng().gen_range(0..items.len());
        Ok(items[index].clone())
    });
}

/// 全为整数且整除时返回整数
fn mean(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("mean", 1, 1)?;
    let items = args.positional[0].iterate()?;
    if items.is_empty() {
        return Err(ExecutionError::ValueError(
            "mean requires at least one data point".into(),
        ));
    }
    let all_ints: Option<Vec<i64>> = items.iter().map(Value::as_i64).collect();
    if let Some(ints) = all_ints {
        let total: i128 = ints.iter().map(|i| *i as i128).sum();
        let n = ints.len() as i128;
        if total % n == 0 {
            return Ok(Value::Integer((total / n) as i64));
        }
        return Ok(Value::Float(total as f64 / n as f64));
    }
    let data = items
        .iter()
        .map(|v| number_arg(v, "mean"))
        .collect::<ExecutionResult<Vec<_>>>()?;
    Ok(Value::Float(data.iter().sum::<f64>() / data.len() as f64))
}

fn randrange(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("randrange", 1, 3)?;
    let ints = args
        .positional
        .iter()
        .map(|v| int_arg(v, "randrange"))
        .collect::<ExecutionResult<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("argument count checked above"),
    };
    if step == 0 {
        return Err(ExecutionError::ValueError("zero step for randrange()".into()));
    }
    let count = if step > 0 {
        (stop - start + step - 1) / step
    } else {
        (start - stop - step - 1) / (-step)
    };
    if count <= 0 {
        return Err(ExecutionError::ValueError(format!(
            "empty range for randrange({}, {}, {})",
            start, stop, step
        )));
    }
    let offset = rand::thread_rng().gen_range(0..count);
    Ok(Value::Integer(start + offset * step))
}

fn numbers(args: &CallArgs, function: &str) -> ExecutionResult<Vec<f64>> {
    args.expect_count(function, 1, 1)?;
    args.positional[0]
        .iterate()?
        .iter()
        .map(|v| number_arg(v, function))
        .collect()
}

fn require_len(data: &[f64], min: usize, message: &str) -> ExecutionResult<()> {
    if data.len() < min {
        return Err(ExecutionError::ValueError(message.to_string()));
    }
    Ok(())
}

fn sorted_values(args: &CallArgs, function: &str) -> ExecutionResult<Vec<Value>> {
    args.expect_count(function, 1, 1)?;
    let mut data = args.positional[0].iterate()?;
    if data.is_empty() {
        return Err(ExecutionError::ValueError("no median for empty data".into()));
    }
    let mut failure = None;
    data.sort_by(|a, b| {
        a.py_cmp(b).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            std::cmp::Ordering::Equal
        })
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(data),
    }
}

/// 出现次数最多的值 (按首次出现顺序)
fn multimode(args: &CallArgs) -> ExecutionResult<Vec<Value>> {
    args.expect_count("multimode", 1, 1)?;
    let mut counts: Vec<(Value, usize)> = Vec::new();
    for item in args.positional[0].iterate()? {
        match counts.iter_mut().find(|(v, _)| v.py_eq(&item)) {
            Some((_, n)) => *n += 1,
            None => counts.push((item, 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max().unwrap_or(0);
    Ok(counts
        .into_iter()
        .filter(|(_, n)| *n == best)
        .map(|(v, _)| v)
        .collect())
}

fn variance(args: &CallArgs, function: &str, sample: bool) -> ExecutionResult<f64> {
    let data = numbers(args, function)?;
    let min = if sample { 2 } else { 1 };
    if data.len() < min {
        return Err(ExecutionError::ValueError(format!(
            "{} requires at least {} data point{}",
            function,
            min,
            if min == 1 { "" } else { "s" }
        )));
    }
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let squares: f64 = data.iter().map(|x| (x - mean).powi(2)).sum();
    Ok(squares / if sample { n - 1.0 } else { n })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, values: &[i64]) -> ExecutionResult<Value> {
        let list = Value::List(values.iter().map(|i| Value::Integer(*i)).collect());
        FunctionRegistry::builtin().call(name, CallArgs::new(vec![list]))
    }

    #[test]
    fn test_means() {
        assert_eq!(call("mean", &[1, 2, 3]).unwrap(), Value::Integer(2));
        assert_eq!(call("mean", &[1, 2]).unwrap(), Value::Float(1.5));
        assert_eq!(call("fmean", &[1, 2, 3]).unwrap(), Value::Float(2.0));
        assert!(matches!(call("mean", &[]), Err(ExecutionError::ValueError(_))));
    }

    #[test]
    fn test_medians() {
        assert_eq!(call("median", &[5, 1, 3]).unwrap(), Value::Integer(3));
        assert_eq!(call("median", &[1, 2, 3, 4]).unwrap(), Value::Float(2.5));
        assert_eq!(call("median_low", &[1, 2, 3, 4]).unwrap(), Value::Integer(2));
        assert_eq!(call("median_high", &[1, 2, 3, 4]).unwrap(), Value::Integer(3));
    }

    #[test]
    fn test_mode() {
        assert_eq!(call("mode", &[1, 2, 2, 3]).unwrap(), Value::Integer(2));
        assert_eq!(
            call("multimode", &[1, 1, 2, 2, 3]).unwrap(),
            Value::List(vec![Value::Integer(1), Value::Integer(2)])
        );
    }

    #[test]
    fn test_variance() {
        let v = call("pvariance", &[1, 2, 3, 4]).unwrap().as_f64().unwrap();
        assert!((v - 1.25).abs() < 1e-9);
        let s = call("stdev", &[2, 4, 4, 4, 5, 5, 7, 9]).unwrap().as_f64().unwrap();
        assert!((s - 2.138089935299395).abs() < 1e-9);
        assert!(matches!(call("variance", &[1]), Err(ExecutionError::ValueError(_))));
    }

    #[test]
    fn test_random_bounds() {
        let registry = FunctionRegistry::builtin();
        for _ in 0..50 {
            let v = registry
                .call("randint", CallArgs::new(vec![Value::Integer(1), Value::Integer(3)]))
                .unwrap();
            let n = v.as_i64().unwrap();
            assert!((1..=3).contains(&n));
        }
        assert!(matches!(
            registry.call("choice", CallArgs::new(vec![Value::List(vec![])])),
            Err(ExecutionError::IndexError(_))
        ));
    }
}
