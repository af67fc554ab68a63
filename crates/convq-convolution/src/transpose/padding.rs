use crate::ConvError;

/// How paddings are obtained for a convolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PaddingAlgorithm {
    /// Paddings are given by the `paddings` attribute.
    #[default]
    Explicit,
    /// Paddings keep the output size at `ceil(input / stride)`.
    Same,
    /// No padding.
    Valid,
}

impl PaddingAlgorithm {
    /// Parse the `padding_algorithm` attribute, an empty value meaning explicit paddings.
    pub fn parse(name: &str) -> Result<Self, ConvError> {
        match name {
            "" | "EXPLICIT" => Ok(Self::Explicit),
            "SAME" => Ok(Self::Same),
            "VALID" => Ok(Self::Valid),
            other => Err(ConvError::invalid(format!(
                "unknown padding algorithm `{other}`"
            ))),
        }
    }
}

/// Paddings before and after each spatial dimension, and dilations in the engine convention where
/// `0` means no dilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPadding {
    pub padding_l: Vec<i64>,
    pub padding_r: Vec<i64>,
    pub dilations: Vec<i64>,
}

/// Resolve paddings and dilations for the given spatial input sizes.
///
/// `paddings` either holds one value per spatial dimension, applied on both sides, or a
/// `[before, after]` pair per dimension.
pub fn resolve_padding(
    algorithm: PaddingAlgorithm,
    paddings: &[i64],
    dilations: &[i64],
    data_dims: &[i64],
    strides: &[i64],
    ksize: &[i64],
) -> Result<ResolvedPadding, ConvError> {
    let rank = data_dims.len();
    if strides.len() != rank || ksize.len() != rank || dilations.len() != rank {
        return Err(ConvError::invalid(format!(
            "strides {strides:?}, dilations {dilations:?} and kernel {ksize:?} must match the \
             {rank} spatial dimensions"
        )));
    }
    if strides.iter().chain(dilations).any(|value| *value <= 0) {
        return Err(ConvError::invalid(format!(
            "strides {strides:?} and dilations {dilations:?} must be positive"
        )));
    }

    let mut pairs: Vec<(i64, i64)> = if paddings.len() == rank {
        paddings.iter().map(|pad| (*pad, *pad)).collect()
    } else if paddings.len() == rank * 2 {
        paddings.chunks(2).map(|pair| (pair[0], pair[1])).collect()
    } else {
        return Err(ConvError::invalid(format!(
            "paddings {paddings:?} must have {rank} or {} elements",
            rank * 2
        )));
    };
    let mut dilations = dilations.to_vec();

    match algorithm {
        PaddingAlgorithm::Explicit => {}
        PaddingAlgorithm::Same => {
            for i in 0..rank {
                let out_size = (data_dims[i] + strides[i] - 1) / strides[i];
                let pad_sum = ((out_size - 1) * strides[i] + ksize[i] - data_dims[i]).max(0);
                let before = pad_sum / 2;
                pairs[i] = (before, pad_sum - before);
                dilations[i] = 1;
            }
        }
        PaddingAlgorithm::Valid => pairs.iter_mut().for_each(|pair| *pair = (0, 0)),
    }

    Ok(ResolvedPadding {
        padding_l: pairs.iter().map(|(before, _)| *before).collect(),
        padding_r: pairs.iter().map(|(_, after)| *after).collect(),
        dilations: dilations.iter().map(|dilation| dilation - 1).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_paddings_are_expanded() {
        let padding = resolve_padding(
            PaddingAlgorithm::Explicit,
            &[1, 2],
            &[1, 2],
            &[5, 5],
            &[1, 1],
            &[3, 3],
        )
        .unwrap();

        assert_eq!(padding.padding_l, vec![1, 2]);
        assert_eq!(padding.padding_r, vec![1, 2]);
        assert_eq!(padding.dilations, vec![0, 1]);
    }

    #[test]
    fn same_padding_resets_dilation() {
        let padding = resolve_padding(
            PaddingAlgorithm::Same,
            &[0, 0],
            &[2, 2],
            &[5, 4],
            &[2, 1],
            &[3, 2],
        )
        .unwrap();

        // out = 3 and 4, pad sums 2 and 1.
        assert_eq!(padding.padding_l, vec![1, 0]);
        assert_eq!(padding.padding_r, vec![1, 1]);
        assert_eq!(padding.dilations, vec![0, 0]);
    }

    #[test]
    fn valid_padding_is_zero() {
        let padding = resolve_padding(
            PaddingAlgorithm::Valid,
            &[1, 1, 2, 2],
            &[1, 1],
            &[5, 5],
            &[1, 1],
            &[3, 3],
        )
        .unwrap();

        assert_eq!(padding.padding_l, vec![0, 0]);
        assert_eq!(padding.padding_r, vec![0, 0]);
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(PaddingAlgorithm::parse("FULL").is_err());
        assert_eq!(PaddingAlgorithm::parse("").unwrap(), PaddingAlgorithm::Explicit);
    }
}
