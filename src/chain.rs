use crate::diagnostics::MissingOffset;
use crate::margin::Measurement;
use crate::math::quadrature_sum;
use crate::paths::{EnumeratedPath, Hop};

/// A path turned into an offset estimate
#[derive(Clone, Debug, PartialEq)]
pub struct ChainedPath {
    pub estimate: Measurement,
    pub hops: Vec<Hop>,
}

/// Sum the hop offsets of a path and propagate their errors in quadrature.
///
/// Hops are treated as independent. A hop whose error was never measured invalidates the whole
/// path; it is reported rather than read as zero.
///
/// # Errors
/// Returns the first hop lacking an error value.
pub fn chain_offsets(hops: &[Hop]) -> Result<Measurement, MissingOffset> {
    let errors = hops
        .iter()
        .map(|hop| {
            hop.error.ok_or(MissingOffset {
                set: hop.set,
                from: hop.from,
                to: hop.to,
            })
        })
        .collect::<Result<Vec<f64>, _>>()?;
    let offset = hops.iter().map(|hop| hop.offset).sum();
    Ok(Measurement::new(offset, quadrature_sum(&errors)))
}

/// Chain every enumerated path, returning the valid ones and the number rejected
pub fn chain_all(paths: Vec<EnumeratedPath>) -> (Vec<ChainedPath>, usize) {
    let mut rejected = 0;
    let chained = paths
        .into_iter()
        .filter_map(|path| match chain_offsets(&path.hops) {
            Ok(estimate) => Some(ChainedPath {
                estimate,
                hops: path.hops,
            }),
            Err(missing) => {
                log::debug!("path rejected: {missing}");
                rejected += 1;
                None
            }
        })
        .collect();
    (chained, rejected)
}
